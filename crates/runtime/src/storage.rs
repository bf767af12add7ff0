//! Stage storage.
//!
//! In-memory associative store for active plans keyed by stage ID, used
//! by the delegated HTTP control surface: `/setup` stores, `/step` looks
//! up, `/destroy` removes. Entries have no TTL; the destroy call is
//! responsible for removal.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hodei_runner_core::{DomainError, Spec};

/// A stored stage entry.
#[derive(Debug, Clone)]
pub struct StageEntry {
    pub added_at: DateTime<Utc>,
    pub spec: Arc<Spec>,
    pub env_vars: HashMap<String, String>,
    pub secret_vars: HashMap<String, String>,
}

/// Mutex-guarded stage map.
#[derive(Debug, Default)]
pub struct StageStorage {
    entries: Mutex<HashMap<String, StageEntry>>,
}

impl StageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a stage. Storing an ID that is already present is an
    /// error; ownership of a stage ID is exclusive.
    pub fn store(
        &self,
        id: &str,
        spec: Arc<Spec>,
        env_vars: HashMap<String, String>,
        secret_vars: HashMap<String, String>,
    ) -> Result<(), DomainError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(id) {
            return Err(DomainError::Validation(format!(
                "stage with id={id} already present"
            )));
        }
        entries.insert(
            id.to_string(),
            StageEntry {
                added_at: Utc::now(),
                spec,
                env_vars,
                secret_vars,
            },
        );
        Ok(())
    }

    /// Looks up a stage entry.
    pub fn get(&self, id: &str) -> Option<StageEntry> {
        self.entries.lock().unwrap().get(id).cloned()
    }

    /// Removes a stage entry, reporting whether a deletion occurred.
    pub fn remove(&self, id: &str) -> bool {
        self.entries.lock().unwrap().remove(id).is_some()
    }
}
