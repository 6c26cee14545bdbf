//! CommandExecutor - timed delivery of one diff's command batch
//!
//! The batch is a window as long as its largest lead time. Every command
//! fires at `start + window - preliminary`, so the whole batch lands on the
//! same nominal instant while slow hardware gets its head start.
//!
//! - **Salvo**: every command runs concurrently
//! - **Sequential**: commands sharing a queue run one after another, queues
//!   run concurrently
//!
//! A failing command is logged and recorded, its siblings carry on.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{error, trace};

use crate::command::CommandWithContext;
use crate::error::CommandError;

/// Execution discipline of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Salvo,
    Sequential,
}

/// Timing of a single delivered command
#[derive(Debug, Clone)]
pub struct CommandTiming {
    pub context: String,
    pub timeline_obj_id: String,
    pub queue_id: String,
    pub preliminary: u64,
    /// When the command should have been sent
    pub target: Instant,
    pub sent_at: Instant,
    /// When the send resolved
    pub fulfilled_at: Instant,
    pub error: Option<CommandError>,
}

impl CommandTiming {
    /// How late the command was handed to the device
    pub fn sent_delay(&self) -> Duration {
        self.sent_at.saturating_duration_since(self.target)
    }

    /// How late the device finished the command
    pub fn fulfilled_delay(&self) -> Duration {
        self.fulfilled_at.saturating_duration_since(self.target)
    }
}

/// Outcome of one batch
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub timings: Vec<CommandTiming>,
}

impl ExecutionReport {
    pub fn failures(&self) -> impl Iterator<Item = &CommandError> {
        self.timings.iter().filter_map(|t| t.error.as_ref())
    }

    pub fn len(&self) -> usize {
        self.timings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timings.is_empty()
    }
}

/// Stateless scheduler; one call per diff result
#[derive(Debug, Clone, Copy)]
pub struct CommandExecutor {
    mode: ExecutionMode,
}

impl CommandExecutor {
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Deliver a batch, resolving once every command was attempted
    pub async fn execute_commands<C, F, Fut>(
        &self,
        mut commands: Vec<CommandWithContext<C>>,
        send: F,
    ) -> ExecutionReport
    where
        F: Fn(CommandWithContext<C>) -> Fut,
        Fut: Future<Output = Result<(), CommandError>>,
    {
        if commands.is_empty() {
            return ExecutionReport::default();
        }

        // Stable: equal lead times keep diff order
        commands.sort_by(|a, b| b.lead_time().cmp(&a.lead_time()));
        let total_time = commands[0].lead_time();
        let start = Instant::now();

        trace!(
            mode = ?self.mode,
            count = commands.len(),
            total_time,
            "Executing command batch"
        );

        let timings = match self.mode {
            ExecutionMode::Salvo => {
                join_all(
                    commands
                        .into_iter()
                        .map(|command| run_command(command, start, total_time, &send)),
                )
                .await
            }
            ExecutionMode::Sequential => {
                let mut queues: BTreeMap<String, Vec<CommandWithContext<C>>> = BTreeMap::new();
                for command in commands {
                    queues.entry(command.queue().to_string()).or_default().push(command);
                }

                let runs = queues.into_values().map(|queue| {
                    let send = &send;
                    async move {
                        let mut timings = Vec::with_capacity(queue.len());
                        for command in queue {
                            timings.push(run_command(command, start, total_time, send).await);
                        }
                        timings
                    }
                });
                join_all(runs).await.into_iter().flatten().collect()
            }
        };

        ExecutionReport { timings }
    }
}

async fn run_command<C, F, Fut>(
    command: CommandWithContext<C>,
    start: Instant,
    total_time: u64,
    send: &F,
) -> CommandTiming
where
    F: Fn(CommandWithContext<C>) -> Fut,
    Fut: Future<Output = Result<(), CommandError>>,
{
    let preliminary = command.lead_time();
    let target = start + Duration::from_millis(total_time - preliminary);
    sleep_until(target).await;

    let context = command.context.clone();
    let timeline_obj_id = command.timeline_obj_id.clone();
    let queue_id = command.queue().to_string();

    let sent_at = Instant::now();
    let result = send(command).await;
    let fulfilled_at = Instant::now();

    if let Err(e) = &result {
        error!(
            context = %context,
            timeline_obj_id = %timeline_obj_id,
            "Error while executing command: {}",
            e.message
        );
    }

    CommandTiming {
        context,
        timeline_obj_id,
        queue_id,
        preliminary,
        target,
        sent_at,
        fulfilled_at,
        error: result.err(),
    }
}
