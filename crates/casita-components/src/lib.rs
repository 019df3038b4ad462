//! Entity platforms and integrations for casita
//!
//! The cover platform (typed commands, capability trait, service
//! routing), YAML-configured demo covers, and the reverse_cover
//! integration that mirrors one source cover with inverted state.

pub mod cover;
pub mod demo;
pub mod reverse_cover;
