//! Active call bookkeeping

use consultrtc_core::{ConsultRtcError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// At most one live session per ordered (caller, callee) pair
#[derive(Debug, Clone, Default)]
pub struct CallRegistry {
    active: Arc<DashMap<(String, String), String>>,
}

impl CallRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the pair for `session_id`. The claim is released when the
    /// returned guard drops.
    pub fn register(&self, caller_id: &str, callee_id: &str, session_id: &str) -> Result<RegistryGuard> {
        let key = (caller_id.to_string(), callee_id.to_string());
        match self.active.entry(key.clone()) {
            Entry::Occupied(_) => Err(ConsultRtcError::SessionAlreadyActive {
                caller_id: caller_id.to_string(),
                callee_id: callee_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(session_id.to_string());
                debug!(caller_id, callee_id, session_id, "Session registered");
                Ok(RegistryGuard {
                    active: self.active.clone(),
                    key,
                    session_id: session_id.to_string(),
                })
            }
        }
    }

    /// Live session for the pair
    pub fn session_for(&self, caller_id: &str, callee_id: &str) -> Option<String> {
        self.active
            .get(&(caller_id.to_string(), callee_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Whether the pair has a live session
    pub fn is_active(&self, caller_id: &str, callee_id: &str) -> bool {
        self.session_for(caller_id, callee_id).is_some()
    }

    /// Number of live sessions
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Releases a registry claim on drop
#[derive(Debug)]
pub struct RegistryGuard {
    active: Arc<DashMap<(String, String), String>>,
    key: (String, String),
    session_id: String,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.key, |_, session_id| *session_id == self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_session_per_pair() {
        let registry = CallRegistry::new();
        let guard = registry.register("patient1", "doc1", "s1").unwrap();
        assert!(matches!(
            registry.register("patient1", "doc1", "s2"),
            Err(ConsultRtcError::SessionAlreadyActive { .. })
        ));
        let reverse = registry.register("doc1", "patient1", "s3").unwrap();
        assert_eq!(registry.active_count(), 2);

        drop(guard);
        assert!(!registry.is_active("patient1", "doc1"));
        let _again = registry.register("patient1", "doc1", "s4").unwrap();
        assert_eq!(registry.session_for("patient1", "doc1").as_deref(), Some("s4"));
        drop(reverse);
        assert_eq!(registry.active_count(), 1);
    }
}
