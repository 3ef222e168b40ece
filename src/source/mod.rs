//! State source: the host automation platform's view of entity states.
//!
//! The engine never talks to the host directly. Everything it needs is
//! behind [`StateSource`], which has a REST adapter for a running host and
//! an in-memory adapter for offline replay.

pub mod memory;
pub mod rest;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::memory::MemorySource;
pub use self::rest::RestStateSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("state source unavailable: {0}")]
    Unavailable(String),

    #[error("entity {0} not found")]
    NotFound(String),
}

/// A raw state as reported by the host, before kind-specific parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawState {
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

impl RawState {
    pub fn new(value: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            timestamp,
        }
    }
}

/// Restricts `list_entities` to a set of domains (the part of an entity id
/// before the first dot). An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub domains: Vec<String>,
}

impl EntityFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, entity_id: &str) -> bool {
        if self.domains.is_empty() {
            return true;
        }
        let domain = entity_id.split('.').next().unwrap_or_default();
        self.domains.iter().any(|d| d == domain)
    }
}

/// Inbound capability required from the host.
#[async_trait::async_trait]
pub trait StateSource: Send + Sync {
    /// Current value of an entity.
    async fn current_state(&self, entity_id: &str) -> Result<RawState, SourceError>;

    /// States recorded in `[from, to]`, in the order the host returns them.
    async fn history(
        &self,
        entity_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawState>, SourceError>;

    /// Entity ids currently known to the host.
    async fn list_entities(&self, filter: &EntityFilter) -> Result<BTreeSet<String>, SourceError>;
}
