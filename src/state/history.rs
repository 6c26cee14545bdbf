//! StateHistory - snapshot store keyed by timestamp
//!
//! Holds the last executed device state (the baseline for the next diff)
//! and the queue of future changes with their precomputed commands. A
//! change inserted at time T invalidates everything queued at or after T;
//! its diff is computed against the latest state strictly before T.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::types::AddressState;
use crate::command::{total_lead_time, CommandWithContext};
use crate::error::DiffError;
use crate::timeline::Mappings;

/// Converted target state of one device at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot<S, A> {
    pub time: i64,
    pub device_state: S,
    pub address_states: BTreeMap<String, AddressState<A>>,
    pub mappings: Mappings,
}

/// Queued snapshot plus the commands that reach it from its predecessor
#[derive(Debug, Clone)]
pub struct StateChange<S, A, C> {
    pub snapshot: StateSnapshot<S, A>,
    pub commands: Vec<CommandWithContext<C>>,
}

impl<S, A, C> StateChange<S, A, C> {
    /// When the batch has to start so the largest lead time is honoured
    pub fn due_time(&self) -> i64 {
        self.snapshot.time - total_lead_time(&self.commands) as i64
    }
}

/// Diff callback: (old device state, new snapshot) -> commands
pub type DiffFn<'a, S, A, C> =
    dyn FnMut(Option<&S>, &StateSnapshot<S, A>) -> Result<Vec<CommandWithContext<C>>, DiffError> + 'a;

pub struct StateHistory<S, A, C> {
    /// Last snapshot handed to the executor
    current: Option<StateSnapshot<S, A>>,
    /// Future changes by nominal time
    queue: BTreeMap<i64, StateChange<S, A, C>>,
}

impl<S: Clone, A: Clone, C> Default for StateHistory<S, A, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone, A: Clone, C> StateHistory<S, A, C> {
    pub fn new() -> Self {
        Self {
            current: None,
            queue: BTreeMap::new(),
        }
    }

    pub fn current(&self) -> Option<&StateSnapshot<S, A>> {
        self.current.as_ref()
    }

    pub fn current_state(&self) -> Option<&S> {
        self.current.as_ref().map(|c| &c.device_state)
    }

    pub fn pending_times(&self) -> Vec<i64> {
        self.queue.keys().copied().collect()
    }

    pub fn pending(&self, time: i64) -> Option<&StateChange<S, A, C>> {
        self.queue.get(&time)
    }

    /// Queue a new snapshot
    ///
    /// Drops everything queued at or after `snapshot.time` first. On a diff
    /// failure nothing is queued and the previous chain stays intact (minus
    /// the invalidated tail). Returns the number of commands queued.
    pub fn insert(
        &mut self,
        snapshot: StateSnapshot<S, A>,
        diff: &mut DiffFn<'_, S, A, C>,
    ) -> Result<usize, DiffError> {
        let time = snapshot.time;
        let dropped = self.clear_future_after_timestamp(time);
        if dropped > 0 {
            debug!(time, dropped, "Superseded queued states");
        }

        let commands = {
            let previous = self.state_before(time);
            diff(previous, &snapshot)?
        };
        let count = commands.len();
        self.queue.insert(time, StateChange { snapshot, commands });
        Ok(count)
    }

    /// Discard queued changes at or after `time`
    pub fn clear_future_after_timestamp(&mut self, time: i64) -> usize {
        let removed = self.queue.split_off(&time);
        removed.len()
    }

    /// Re-diff every queued change against its predecessor
    ///
    /// Used when the baseline or the tracker changed. A change whose diff
    /// fails is dropped and reported.
    pub fn recalculate(&mut self, diff: &mut DiffFn<'_, S, A, C>) -> Vec<(i64, DiffError)> {
        let mut failures = Vec::new();
        let mut previous = self.current_state().cloned();

        for time in self.pending_times() {
            let Some(change) = self.queue.get_mut(&time) else {
                continue;
            };
            match diff(previous.as_ref(), &change.snapshot) {
                Ok(commands) => {
                    change.commands = commands;
                    previous = Some(change.snapshot.device_state.clone());
                }
                Err(e) => {
                    warn!(time, "Dropping queued state, diff failed: {}", e);
                    self.queue.remove(&time);
                    failures.push((time, e));
                }
            }
        }

        failures
    }

    /// Nominal time minus lead time of the first queued change
    pub fn next_due_time(&self) -> Option<i64> {
        self.queue.values().next().map(StateChange::due_time)
    }

    /// Take the first queued change if it is due at `now`
    ///
    /// The popped snapshot becomes the new baseline.
    pub fn pop_due(&mut self, now: i64) -> Option<StateChange<S, A, C>> {
        if self.next_due_time()? > now {
            return None;
        }
        let (_, change) = self.queue.pop_first()?;
        self.current = Some(change.snapshot.clone());
        Some(change)
    }

    /// Declare what the device holds before anything was executed
    ///
    /// Queued changes diff against it from now on. Ignored once a state was
    /// executed (use `diff_current` then).
    pub fn set_baseline(&mut self, device_state: S) -> bool {
        if self.current.is_some() {
            return false;
        }
        self.current = Some(StateSnapshot {
            time: i64::MIN,
            device_state,
            address_states: BTreeMap::new(),
            mappings: Mappings::new(),
        });
        true
    }

    /// Commands taking the device from `old` to the current target
    ///
    /// `None` when nothing was executed yet.
    pub fn diff_current(
        &self,
        old: Option<&S>,
        diff: &mut DiffFn<'_, S, A, C>,
    ) -> Option<Result<Vec<CommandWithContext<C>>, DiffError>> {
        let current = self.current.as_ref()?;
        Some(diff(old, current))
    }

    /// Latest known state strictly before `time`
    fn state_before(&self, time: i64) -> Option<&S> {
        self.queue
            .range(..time)
            .next_back()
            .map(|(_, c)| &c.snapshot.device_state)
            .or_else(|| self.current_state())
    }
}
