//! Visual targets a renderer draws into.
//!
//! A [`Target`] stands in for the element a component renders into. It is
//! owned by at most one renderer at a time, and it can be removed by code
//! outside the renderer. Both changes are published through a watch channel
//! so the owning renderer notices them without polling.

use crate::utils::lock;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

/// Observable state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetState {
    pub removed: bool,
    /// Renderer currently drawing into the target
    pub owner: Option<Uuid>,
}

#[derive(Clone)]
pub struct Target {
    id: Uuid,
    label: Arc<str>,
    state: Arc<watch::Sender<TargetState>>,
    /// Serializes claims so two renderers can't both believe they won.
    claims: Arc<Mutex<()>>,
}

impl Target {
    pub fn new(label: impl Into<String>) -> Self {
        let (sender, _) = watch::channel(TargetState::default());
        Self {
            id: Uuid::new_v4(),
            label: Arc::from(label.into()),
            state: Arc::new(sender),
            claims: Arc::new(Mutex::new(())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> TargetState {
        *self.state.borrow()
    }

    pub fn is_removed(&self) -> bool {
        self.state.borrow().removed
    }

    pub fn owner(&self) -> Option<Uuid> {
        self.state.borrow().owner
    }

    /// Detach the target. Its owner notices and stops rendering into it.
    pub fn remove(&self) {
        self.state.send_modify(|state| {
            state.removed = true;
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<TargetState> {
        self.state.subscribe()
    }

    /// Make `owner` the owner, returning the renderer it was taken from.
    pub(crate) fn claim(&self, owner: Uuid) -> Option<Uuid> {
        let _claim = lock(&self.claims);
        let previous = self.owner();
        self.state.send_modify(|state| state.owner = Some(owner));
        previous.filter(|previous| *previous != owner)
    }

    /// Drop ownership, unless someone else took the target in the meantime.
    pub(crate) fn release(&self, owner: Uuid) {
        let _claim = lock(&self.claims);
        self.state.send_if_modified(|state| {
            if state.owner == Some(owner) {
                state.owner = None;
                true
            } else {
                false
            }
        });
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Target {}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_reports_previous_owner() {
        let target = Target::new("chart");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(target.claim(first), None);
        assert_eq!(target.claim(first), None);
        assert_eq!(target.claim(second), Some(first));
        assert_eq!(target.owner(), Some(second));
    }

    #[test]
    fn test_release_only_by_owner() {
        let target = Target::new("chart");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        target.claim(first);
        target.claim(second);
        target.release(first);
        assert_eq!(target.owner(), Some(second));
        target.release(second);
        assert_eq!(target.owner(), None);
    }

    #[test]
    fn test_remove_is_visible_to_subscribers() {
        let target = Target::new("chart");
        let receiver = target.subscribe();
        target.remove();
        assert!(target.is_removed());
        assert!(receiver.borrow().removed);
    }
}
