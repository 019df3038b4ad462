//! Config entries for casita
//!
//! Configured integration instances and the flows that create them. A
//! config flow gathers input from the user and produces a ConfigEntry;
//! the ConfigEntries manager persists entries and drives each one
//! through setup and unload via its integration's EntryHandler.

pub mod entry;
pub mod flow;
pub mod manager;
pub mod state_machine;

pub use entry::{ConfigEntry, ConfigEntryState};
pub use flow::{
    ConfigFlow, FlowContext, FlowError, FlowFactory, FlowManager, FlowResult, FlowStep, FormField,
    Selector, ABORT_ALREADY_CONFIGURED, STEP_USER,
};
pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult, EntryHandler,
};
pub use state_machine::InvalidTransition;
