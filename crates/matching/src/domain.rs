//! Domain metadata lookup
//!
//! The engine only needs to know whether a domain exists and whether this
//! cluster is its active replica.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Registration state of a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    Registered,
    Deprecated,
    Deleted,
}

/// Domain metadata as seen by matching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEntry {
    pub id: String,
    pub name: String,
    pub status: DomainStatus,

    /// Whether this cluster is the active replica of the domain
    pub is_active: bool,
}

impl DomainEntry {
    /// Registered, active domain
    pub fn active(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: DomainStatus::Registered,
            is_active: true,
        }
    }

    /// Registered domain whose active replica lives elsewhere
    pub fn passive(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            is_active: false,
            ..Self::active(id, name)
        }
    }
}

/// Domain lookup errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DomainError {
    #[error("domain not found: {0}")]
    NotFound(String),

    #[error("domain deleted: {0}")]
    Deleted(String),

    #[error("domain lookup failed: {0}")]
    Lookup(String),
}

/// Cache of domain metadata keyed by domain ID
#[async_trait]
pub trait DomainCache: Send + Sync + 'static {
    /// Look a domain up by ID
    async fn get_domain_by_id(&self, id: &str) -> Result<Arc<DomainEntry>, DomainError>;
}

/// Domain cache backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryDomainCache {
    domains: DashMap<String, Arc<DomainEntry>>,
}

impl InMemoryDomainCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a domain
    pub fn register(&self, entry: DomainEntry) {
        self.domains.insert(entry.id.clone(), Arc::new(entry));
    }

    /// Builder-style registration
    pub fn with_domain(self, entry: DomainEntry) -> Self {
        self.register(entry);
        self
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[async_trait]
impl DomainCache for InMemoryDomainCache {
    async fn get_domain_by_id(&self, id: &str) -> Result<Arc<DomainEntry>, DomainError> {
        let entry = self
            .domains
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| DomainError::NotFound(id.to_string()))?;

        if entry.status == DomainStatus::Deleted {
            return Err(DomainError::Deleted(id.to_string()));
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup() {
        let cache = InMemoryDomainCache::new()
            .with_domain(DomainEntry::active("d1", "orders"))
            .with_domain(DomainEntry::passive("d2", "billing"));

        let d1 = cache.get_domain_by_id("d1").await.unwrap();
        assert_eq!(d1.name, "orders");
        assert!(d1.is_active);
        assert!(!cache.get_domain_by_id("d2").await.unwrap().is_active);
        assert!(matches!(
            cache.get_domain_by_id("missing").await,
            Err(DomainError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deleted_domain() {
        let cache = InMemoryDomainCache::new();
        cache.register(DomainEntry {
            status: DomainStatus::Deleted,
            ..DomainEntry::active("d1", "gone")
        });
        assert!(matches!(
            cache.get_domain_by_id("d1").await,
            Err(DomainError::Deleted(_))
        ));
    }
}
