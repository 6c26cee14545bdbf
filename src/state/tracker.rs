//! StateTracker - expected vs observed state per address
//!
//! Lets a device tolerate a third party (an operator on the desk, another
//! automation system) taking over individual addresses. The tracker keeps,
//! per address, what we last dispatched and what the device last reported,
//! and flags addresses whose observed content diverges from ours under a
//! different owner.
//!
//! The tracker never fails: an unknown address simply means "no
//! information", which reads as not blocked.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

use super::types::{AddressEntry, AddressState};
use crate::devices::SharedControl;

/// Signal raised by feedback processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerSignal {
    /// A third party took control of the address
    Blocked,
    /// The address is back to what we expect
    Released,
}

/// Per-address ownership tracker for one device
pub struct StateTracker<S, A> {
    control: Arc<dyn SharedControl<S, A>>,
    entries: BTreeMap<String, AddressEntry<A>>,
}

impl<S, A: Clone> StateTracker<S, A> {
    pub fn new(control: Arc<dyn SharedControl<S, A>>) -> Self {
        Self {
            control,
            entries: BTreeMap::new(),
        }
    }

    /// Record what was dispatched for an address
    ///
    /// Call once the batch carrying the address has been handed to the
    /// executor. Clears any blocked flag: we just reasserted control.
    pub fn update_expected_state(
        &mut self,
        address: &str,
        state: AddressState<A>,
        control_value_override: Option<String>,
    ) {
        let entry = self.entries.entry(address.to_string()).or_default();
        entry.control_value = Some(control_value_override.unwrap_or_else(|| state.control_value.clone()));
        entry.expected = Some(state);
        if entry.blocked {
            debug!(address, "Address control reasserted");
        }
        entry.blocked = false;
    }

    /// Feed a state reported by the device
    ///
    /// Returns `Blocked` when the content changed and a different owner now
    /// holds it, `Released` when a blocked address came back to what we
    /// expect. Feeding the same content twice never signals twice.
    pub fn update_state(&mut self, address: &str, observed: AddressState<A>) -> Option<TrackerSignal> {
        let control = self.control.clone();
        let entry = self.entries.entry(address.to_string()).or_default();

        let changed = entry
            .observed
            .as_ref()
            .map_or(true, |prev| control.diff_address_states(prev, &observed));
        let matches_expected = entry
            .expected
            .as_ref()
            .map_or(false, |expected| !control.diff_address_states(expected, &observed));
        let reasserts = control.address_state_reasserts_control(entry.expected.as_ref(), &observed);

        entry.observed = Some(observed);

        if !changed {
            trace!(address, "Feedback without content change");
            return None;
        }

        if matches_expected {
            if entry.blocked {
                entry.blocked = false;
                debug!(address, "Address released back to expected state");
                return Some(TrackerSignal::Released);
            }
            return None;
        }

        if reasserts {
            entry.blocked = true;
            debug!(address, "Address taken over by third party");
            return Some(TrackerSignal::Blocked);
        }

        None
    }

    pub fn get_control_value(&self, address: &str) -> Option<&str> {
        self.entries
            .get(address)
            .and_then(|e| e.control_value.as_deref())
    }

    /// Claim an address without touching its state payload
    pub fn set_control_value(&mut self, address: &str, value: impl Into<String>) {
        self.entries.entry(address.to_string()).or_default().control_value = Some(value.into());
    }

    /// Every address ever seen, expected or observed
    pub fn get_all_addresses(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        self.entries.get(address).map_or(false, |e| e.blocked)
    }

    pub fn expected(&self, address: &str) -> Option<&AddressState<A>> {
        self.entries.get(address).and_then(|e| e.expected.as_ref())
    }

    pub fn observed(&self, address: &str) -> Option<&AddressState<A>> {
        self.entries.get(address).and_then(|e| e.observed.as_ref())
    }

    /// Whether we keep yielding `address` to the third party
    ///
    /// We yield while the control value we would assert is the one we
    /// already asserted. A new control value means new intent and takes the
    /// address back.
    pub fn yields_to(&self, address: &str, new_control_value: Option<&str>) -> bool {
        self.get_control_value(address) == new_control_value
    }

    pub fn control(&self) -> &Arc<dyn SharedControl<S, A>> {
        &self.control
    }

    fn blocked_entries(&self) -> impl Iterator<Item = (&String, &AddressState<A>)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.blocked)
            .filter_map(|(addr, e)| e.observed.as_ref().map(|obs| (addr, obs)))
    }
}

/// Copy of `state` with the externally imposed value of every blocked
/// address applied, for the addresses where `yield_control` holds
///
/// Diffing a masked old state against a masked new state produces no
/// command for an address held by someone else.
pub fn mask_blocked_addresses<S: Clone, A: Clone>(
    state: &S,
    tracker: &StateTracker<S, A>,
    yield_control: impl Fn(&str) -> bool,
) -> S {
    let mut masked = state.clone();
    for (address, observed) in tracker.blocked_entries() {
        if yield_control(address) {
            tracker.control.apply_address_state(&mut masked, address, observed);
        }
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::AddressIndex;
    use std::collections::BTreeMap;

    type FaderState = BTreeMap<String, u32>;

    /// Minimal fader bank: address "fader.N" holds a level
    struct FaderControl;

    impl SharedControl<FaderState, u32> for FaderControl {
        fn apply_address_state(&self, state: &mut FaderState, address: &str, address_state: &AddressState<u32>) {
            state.insert(address.to_string(), address_state.state);
        }

        fn diff_address_states(&self, a: &AddressState<u32>, b: &AddressState<u32>) -> bool {
            a.state != b.state
        }
    }

    fn tracker() -> StateTracker<FaderState, u32> {
        StateTracker::new(Arc::new(FaderControl))
    }

    fn ours(level: u32, control_value: &str) -> AddressState<u32> {
        AddressState::new(control_value, vec![AddressIndex::Num(1)], level)
    }

    fn feedback(level: u32) -> AddressState<u32> {
        AddressState::observed(vec![AddressIndex::Num(1)], level)
    }

    #[test]
    fn test_blocked_raised_once() {
        let mut tracker = tracker();
        tracker.update_expected_state("fader.1", ours(50, "c1"), None);

        assert_eq!(tracker.update_state("fader.1", feedback(80)), Some(TrackerSignal::Blocked));
        assert!(tracker.is_blocked("fader.1"));

        // Same content again: no second signal
        assert_eq!(tracker.update_state("fader.1", feedback(80)), None);
        assert!(tracker.is_blocked("fader.1"));
    }

    #[test]
    fn test_echo_of_own_state_not_blocked() {
        let mut tracker = tracker();
        tracker.update_expected_state("fader.1", ours(50, "c1"), None);
        assert_eq!(tracker.update_state("fader.1", feedback(50)), None);
        assert!(!tracker.is_blocked("fader.1"));
    }

    #[test]
    fn test_release_after_block() {
        let mut tracker = tracker();
        tracker.update_expected_state("fader.1", ours(50, "c1"), None);
        tracker.update_state("fader.1", feedback(80));

        assert_eq!(tracker.update_state("fader.1", feedback(50)), Some(TrackerSignal::Released));
        assert!(!tracker.is_blocked("fader.1"));
    }

    #[test]
    fn test_feedback_without_expected_state() {
        let mut tracker = tracker();
        // Nothing dispatched yet: any reported content belongs to someone else
        assert_eq!(tracker.update_state("fader.2", feedback(10)), Some(TrackerSignal::Blocked));
    }

    #[test]
    fn test_expected_update_clears_block() {
        let mut tracker = tracker();
        tracker.update_expected_state("fader.1", ours(50, "c1"), None);
        tracker.update_state("fader.1", feedback(80));
        assert!(tracker.is_blocked("fader.1"));

        tracker.update_expected_state("fader.1", ours(60, "c2"), None);
        assert!(!tracker.is_blocked("fader.1"));
        assert_eq!(tracker.get_control_value("fader.1"), Some("c2"));
    }

    #[test]
    fn test_control_value_override_and_unknown_address() {
        let mut tracker = tracker();
        tracker.update_expected_state("fader.1", ours(50, "c1"), Some("forced".into()));
        assert_eq!(tracker.get_control_value("fader.1"), Some("forced"));

        tracker.set_control_value("fader.9", "c9");
        assert_eq!(tracker.get_control_value("fader.9"), Some("c9"));
        assert!(tracker.expected("fader.9").is_none());

        assert!(!tracker.is_blocked("nope"));
        assert!(tracker.get_control_value("nope").is_none());
        assert_eq!(tracker.get_all_addresses(), vec!["fader.1", "fader.9"]);
    }

    #[test]
    fn test_mask_blocked_addresses() {
        let mut tracker = tracker();
        tracker.update_expected_state("fader.1", ours(50, "c1"), None);
        tracker.update_expected_state("fader.2", ours(20, "c1"), None);
        tracker.update_state("fader.1", feedback(80));

        let mut target = FaderState::new();
        target.insert("fader.1".into(), 50);
        target.insert("fader.2".into(), 20);

        let masked = mask_blocked_addresses(&target, &tracker, |_| true);
        assert_eq!(masked["fader.1"], 80);
        assert_eq!(masked["fader.2"], 20);

        // New control value: we take the address back, so no masking
        let reassert = mask_blocked_addresses(&target, &tracker, |addr| tracker.yields_to(addr, Some("c2")));
        assert_eq!(reassert["fader.1"], 50);

        let keep_yielding = mask_blocked_addresses(&target, &tracker, |addr| tracker.yields_to(addr, Some("c1")));
        assert_eq!(keep_yielding["fader.1"], 80);
    }
}
