//! Command & context model
//!
//! A `CommandWithContext` is the unit of work produced by a device diff and
//! consumed exactly once by the command executor.

use serde::{Deserialize, Serialize};

/// Queue used for commands that don't name one
pub const DEFAULT_QUEUE: &str = "$$default";

/// A device command plus the metadata needed to schedule and report it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandWithContext<C> {
    /// Device-specific command payload
    pub command: C,
    /// Human readable reason for the command (shown in logs and reports)
    pub context: String,
    /// Timeline object that caused the command
    pub timeline_obj_id: String,
    /// Milliseconds to send the command before its nominal time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preliminary: Option<u64>,
    /// Commands sharing a queue id execute in order in sequential mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
}

impl<C> CommandWithContext<C> {
    pub fn new(command: C, context: impl Into<String>, timeline_obj_id: impl Into<String>) -> Self {
        Self {
            command,
            context: context.into(),
            timeline_obj_id: timeline_obj_id.into(),
            preliminary: None,
            queue_id: None,
        }
    }

    pub fn with_preliminary(mut self, preliminary: u64) -> Self {
        self.preliminary = Some(preliminary);
        self
    }

    pub fn with_queue(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    /// Lead time in milliseconds (0 when unset)
    pub fn lead_time(&self) -> u64 {
        self.preliminary.unwrap_or(0)
    }

    /// Queue this command belongs to
    pub fn queue(&self) -> &str {
        self.queue_id.as_deref().unwrap_or(DEFAULT_QUEUE)
    }
}

/// Largest lead time in a batch, which is the length of its execution window
pub fn total_lead_time<C>(commands: &[CommandWithContext<C>]) -> u64 {
    commands.iter().map(|c| c.lead_time()).max().unwrap_or(0)
}
