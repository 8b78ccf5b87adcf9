//! Presence Registry
//!
//! Holds the latest `online-users` snapshot pushed by the signaling server.
//! Snapshots are immutable and replaced wholesale; a reader that kept an
//! older `Arc<PresenceSnapshot>` simply holds stale data.

use crate::signaling::PresenceEntry;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;

/// One complete view of who is online
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    users: Vec<PresenceEntry>,
}

impl PresenceSnapshot {
    pub fn new(users: Vec<PresenceEntry>) -> Self {
        Self { users }
    }

    /// All online users in the order the server sent them
    pub fn users(&self) -> &[PresenceEntry] {
        &self.users
    }

    /// Number of online users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Looks up one user by id
    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.users.iter().find(|u| u.user_id == user_id)
    }

    /// Distinct departments, sorted
    pub fn departments(&self) -> BTreeSet<String> {
        self.users.iter().map(|u| u.department.clone()).collect()
    }

    /// User ids in `department`, in snapshot order
    pub fn users_in_department(&self, department: &str) -> Vec<String> {
        self.users
            .iter()
            .filter(|u| u.department == department)
            .map(|u| u.user_id.clone())
            .collect()
    }

    /// Everyone except the local user
    pub fn callable_users(&self, self_id: &str) -> Vec<&PresenceEntry> {
        self.users.iter().filter(|u| u.user_id != self_id).collect()
    }
}

/// Thread-safe holder of the current snapshot
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    current: RwLock<Arc<PresenceSnapshot>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole presence set and returns the new snapshot
    pub fn apply_snapshot(&self, users: Vec<PresenceEntry>) -> Arc<PresenceSnapshot> {
        let snapshot = Arc::new(PresenceSnapshot::new(users));
        *self.current.write() = Arc::clone(&snapshot);
        tracing::debug!("Presence updated: {} user(s) online", snapshot.len());
        snapshot
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<PresenceSnapshot> {
        self.current.read().clone()
    }

    /// Departments of the current snapshot
    pub fn departments(&self) -> BTreeSet<String> {
        self.snapshot().departments()
    }

    /// User ids of the current snapshot in `department`
    pub fn users_in_department(&self, department: &str) -> Vec<String> {
        self.snapshot().users_in_department(department)
    }

    /// Drops all presence data, e.g. when the socket goes away
    pub fn clear(&self) -> Arc<PresenceSnapshot> {
        self.apply_snapshot(Vec::new())
    }
}

// ============================================================================
// TESTS
// ============================================================================
