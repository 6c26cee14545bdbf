//! Address state type definitions
//!
//! An address is an independently controllable slice of a device (one mixer
//! channel, one keyer, one port). Its state travels with an ownership
//! fingerprint, the control value.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One component of an address index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressIndex {
    Num(i64),
    Str(String),
}

impl fmt::Display for AddressIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressIndex::Num(n) => write!(f, "{}", n),
            AddressIndex::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for AddressIndex {
    fn from(n: i64) -> Self {
        AddressIndex::Num(n)
    }
}

impl From<&str> for AddressIndex {
    fn from(s: &str) -> Self {
        AddressIndex::Str(s.to_string())
    }
}

/// State of one address plus the fingerprint of whoever asserted it
///
/// A change of `control_value` (not its content) means ownership of the
/// address moved. Feedback coming from the device carries an empty control
/// value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressState<T> {
    pub control_value: String,
    pub index: Vec<AddressIndex>,
    pub state: T,
}

impl<T> AddressState<T> {
    pub fn new(control_value: impl Into<String>, index: Vec<AddressIndex>, state: T) -> Self {
        Self {
            control_value: control_value.into(),
            index,
            state,
        }
    }

    /// Address state reported by the device itself
    pub fn observed(index: Vec<AddressIndex>, state: T) -> Self {
        Self::new(String::new(), index, state)
    }
}

/// Tracker bookkeeping for one address
#[derive(Debug, Clone, PartialEq)]
pub struct AddressEntry<T> {
    /// What we last dispatched for the address
    pub expected: Option<AddressState<T>>,
    /// What the device last reported
    pub observed: Option<AddressState<T>>,
    /// Ownership fingerprint we currently assert
    pub control_value: Option<String>,
    /// A third party holds the address
    pub blocked: bool,
}

impl<T> Default for AddressEntry<T> {
    fn default() -> Self {
        Self {
            expected: None,
            observed: None,
            control_value: None,
            blocked: false,
        }
    }
}
