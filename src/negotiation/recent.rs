//! Recent-target list
//!
//! Most-recent-first, deduplicated and capped. Durability belongs to the
//! injected [`Store`]; this type only computes the next list and reports
//! what was inserted and evicted.

use std::sync::Arc;

use url::Url;

use crate::error::{NegotiatorError, Result};
use crate::store::{MemoryStore, Store};

/// What a [`RecentTargets::record`] call changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentChange {
    /// Entry now at the head of the list.
    pub inserted: String,
    /// Earlier entries dropped, either duplicates of `inserted` or entries
    /// pushed past the capacity.
    pub evicted: Vec<String>,
}

/// Recent-target list over a replace-whole-collection store.
#[derive(Debug, Clone)]
pub struct RecentTargets {
    store: Arc<dyn Store<Vec<String>>>,
    capacity: usize,
}

impl RecentTargets {
    /// Creates a list holding at most `capacity` entries.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiatorError::Config`] when `capacity` is zero.
    pub fn new(store: Arc<dyn Store<Vec<String>>>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(
                NegotiatorError::Config("recent list capacity must be positive".to_string()).into(),
            );
        }
        Ok(Self { store, capacity })
    }

    /// In-memory list.
    pub fn in_memory(capacity: usize) -> Result<Self> {
        Self::new(Arc::new(MemoryStore::<Vec<String>>::default()), capacity)
    }

    /// Entries, most recent first.
    pub fn list(&self) -> Result<Vec<String>> {
        self.store.get()
    }

    /// Moves `target` to the head of the list.
    ///
    /// Entries that normalize to the same server URL as `target` are
    /// replaced, so `example.com/mcp` and `https://example.com/mcp` occupy a
    /// single slot.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcp_negotiator::negotiation::recent::RecentTargets;
    ///
    /// let recent = RecentTargets::in_memory(2).unwrap();
    /// recent.record("a.example").unwrap();
    /// recent.record("b.example").unwrap();
    /// let change = recent.record("c.example").unwrap();
    /// assert_eq!(change.evicted, vec!["a.example".to_string()]);
    /// assert_eq!(recent.list().unwrap(), vec!["c.example", "b.example"]);
    /// ```
    pub fn record(&self, target: &str) -> Result<RecentChange> {
        let inserted = target.trim().to_string();
        let key = normalize(&inserted);

        let current = self.store.get()?;
        let mut evicted = Vec::new();
        let mut next = Vec::with_capacity(self.capacity);
        next.push(inserted.clone());
        for entry in current {
            if normalize(&entry) == key {
                if entry != inserted {
                    evicted.push(entry);
                }
            } else if next.len() < self.capacity {
                next.push(entry);
            } else {
                evicted.push(entry);
            }
        }

        self.store.replace_all(next)?;
        tracing::debug!(target = %inserted, evicted = evicted.len(), "Recorded recent target");
        Ok(RecentChange { inserted, evicted })
    }
}

fn normalize(target: &str) -> String {
    let trimmed = target.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    match Url::parse(&with_scheme) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => trimmed.to_ascii_lowercase(),
    }
}
