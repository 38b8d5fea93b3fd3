use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// State scoped to one tab. Single-owner; the guard flag only protects the
/// owning task against re-entrant bootstrap attempts, it is not a cross-tab
/// lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TabLocalState {
    pub org_selected: bool,
    pub bootstrap_in_flight: bool,
}

impl TabLocalState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// The one value shared across tabs and reloads: the most recently activated
/// organization. Cleared on sign-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveOrgRecord {
    pub org_id: Option<String>,
}

impl ActiveOrgRecord {
    #[must_use]
    pub fn activated(org_id: impl Into<String>) -> Self {
        Self {
            org_id: Some(org_id.into()),
        }
    }
}

/// Durable cross-tab storage for [`ActiveOrgRecord`]. Last-write-wins;
/// correctness across tabs relies on the backend's idempotent creation
/// guarantee, not on client-side locking.
pub trait ActiveOrgStore {
    type Error: std::error::Error + Send + Sync + 'static;

    fn load_active_org(&self) -> Result<ActiveOrgRecord, Self::Error>;
    fn persist_active_org(&self, record: &ActiveOrgRecord) -> Result<(), Self::Error>;
    fn clear_active_org(&self) -> Result<(), Self::Error>;
}

/// Process-local [`ActiveOrgStore`] used by tests and by hosts that keep the
/// durable copy elsewhere. Clone shares the underlying record.
#[derive(Debug, Clone, Default)]
pub struct MemoryActiveOrgStore {
    record: Arc<Mutex<ActiveOrgRecord>>,
}

impl MemoryActiveOrgStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_active_org(org_id: impl Into<String>) -> Self {
        Self {
            record: Arc::new(Mutex::new(ActiveOrgRecord::activated(org_id))),
        }
    }
}

impl ActiveOrgStore for MemoryActiveOrgStore {
    type Error = Infallible;

    fn load_active_org(&self) -> Result<ActiveOrgRecord, Self::Error> {
        Ok(self
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn persist_active_org(&self, record: &ActiveOrgRecord) -> Result<(), Self::Error> {
        *self
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = record.clone();
        Ok(())
    }

    fn clear_active_org(&self) -> Result<(), Self::Error> {
        self.persist_active_org(&ActiveOrgRecord::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips_and_clears() {
        let store = MemoryActiveOrgStore::new();
        assert_eq!(store.load_active_org().map(|r| r.org_id), Ok(None));

        store
            .persist_active_org(&ActiveOrgRecord::activated("org_1"))
            .expect("persist");
        assert_eq!(
            store.load_active_org().map(|r| r.org_id),
            Ok(Some("org_1".to_string()))
        );

        store.clear_active_org().expect("clear");
        assert_eq!(store.load_active_org().map(|r| r.org_id), Ok(None));
    }

    #[test]
    fn clones_share_the_record_like_tabs_share_storage() {
        let store = MemoryActiveOrgStore::new();
        let other_tab = store.clone();

        store
            .persist_active_org(&ActiveOrgRecord::activated("org_7"))
            .expect("persist");
        assert_eq!(
            other_tab.load_active_org().map(|r| r.org_id),
            Ok(Some("org_7".to_string()))
        );
    }

    #[test]
    fn tab_local_state_resets_to_defaults() {
        let mut state = TabLocalState {
            org_selected: true,
            bootstrap_in_flight: true,
        };
        state.reset();
        assert_eq!(state, TabLocalState::default());
    }
}
