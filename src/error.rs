//! Error taxonomy for the state pipeline
//!
//! Conversion and diff errors abort one cycle and keep the previous
//! baseline. Command errors are isolated to the single command that failed.
//! Action failures are values (`ActionExecutionResult`), not errors.

use thiserror::Error;

/// Failure converting a timeline state into a device state
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConversionError {
    #[error("layer '{layer}': {reason}")]
    InvalidLayer { layer: String, reason: String },

    #[error("mapping for layer '{layer}' targets unknown {what} '{id}'")]
    UnknownTarget {
        layer: String,
        what: &'static str,
        id: String,
    },
}

/// Failure diffing two device states
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DiffError {
    #[error("inconsistent device state: {0}")]
    Inconsistent(String),

    #[error("conversion failed: {0}")]
    Conversion(#[from] ConversionError),
}

/// A single command could not be sent
///
/// Carries the command context so the failure can be reported without the
/// command value itself.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("command for '{timeline_obj_id}' ({context}) failed: {message}")]
pub struct CommandError {
    pub message: String,
    pub context: String,
    pub timeline_obj_id: String,
}

impl CommandError {
    pub fn new(
        message: impl Into<String>,
        context: impl Into<String>,
        timeline_obj_id: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            context: context.into(),
            timeline_obj_id: timeline_obj_id.into(),
        }
    }

    /// Wrap a transport error with the context of the command that caused it
    pub fn from_command<C>(
        err: impl std::fmt::Display,
        command: &crate::command::CommandWithContext<C>,
    ) -> Self {
        Self::new(err.to_string(), &command.context, &command.timeline_obj_id)
    }
}

/// Transport level failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("transport '{0}' is not connected")]
    NotConnected(String),

    #[error("transport '{name}' rejected payload: {reason}")]
    Rejected { name: String, reason: String },
}

/// Configuration problems surfaced at startup
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("device type '{0}' has no registry entry")]
    UnregisteredDeviceType(String),

    #[error("mapping '{layer}' targets unknown device '{device_id}'")]
    UnknownDevice { layer: String, device_id: String },

    #[error("mapping '{layer}' is a {mapping} mapping but device '{device_id}' is {device}")]
    DeviceTypeMismatch {
        layer: String,
        device_id: String,
        mapping: String,
        device: String,
    },
}
