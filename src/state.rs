//! State management - address ownership tracking and state history
//!
//! `StateTracker` reconciles expected vs observed state per address for
//! devices under shared control. `StateHistory` keeps the executed baseline
//! and the queue of future device states of one device instance.

pub mod history;
pub mod tracker;
mod types;

pub use history::{StateChange, StateHistory, StateSnapshot};
pub use tracker::{mask_blocked_addresses, StateTracker, TrackerSignal};
pub use types::{AddressEntry, AddressIndex, AddressState};
