//! Correlation Table (spec §4.8): a short-lived `device → corr token`
//! map guarding against lost correlation echoes.
//!
//! The mutex protects only the map access itself (spec §5), matching
//! the teacher's `state.rs` convention of holding a lock for exactly
//! the critical section and nothing else. The race between `set` and a
//! spontaneous echo arriving first is intentionally left unresolved —
//! see the design notes.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<String, String>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites any prior pending token for the device.
    pub fn set(&self, internal_id: &str, token: &str) {
        self.pending
            .lock()
            .unwrap()
            .insert(internal_id.to_string(), token.to_string());
    }

    /// Returns and clears the pending token, if any.
    pub fn consume(&self, internal_id: &str) -> Option<String> {
        self.pending.lock().unwrap().remove(internal_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn consume_returns_and_clears() {
        let table = CorrelationTable::new();
        table.set("dev-1", "corr-1");
        assert_eq!(table.consume("dev-1").as_deref(), Some("corr-1"));
        assert_eq!(table.consume("dev-1"), None);
    }

    #[test]
    fn set_overwrites_prior_pending_token() {
        let table = CorrelationTable::new();
        table.set("dev-1", "corr-1");
        table.set("dev-1", "corr-2");
        assert_eq!(table.consume("dev-1").as_deref(), Some("corr-2"));
    }

    #[test]
    fn consume_before_set_yields_no_retroactive_correlation() {
        // The spec's defined race: an echo arriving before Set
        // completes must not retroactively pick up a later token.
        let table = Arc::new(CorrelationTable::new());
        assert_eq!(table.consume("dev-1"), None);
        table.set("dev-1", "corr-1");
        assert_eq!(table.consume("dev-1").as_deref(), Some("corr-1"));
    }

    #[test]
    fn safe_for_concurrent_access() {
        let table = Arc::new(CorrelationTable::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                table.set(&format!("dev-{i}"), &format!("corr-{i}"));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..8 {
            assert_eq!(
                table.consume(&format!("dev-{i}")).as_deref(),
                Some(format!("corr-{i}").as_str())
            );
        }
    }
}
