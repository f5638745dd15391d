//! Resource store abstraction.
//!
//! All operator state lives in the store. Records carry their version token in
//! `metadata.resourceVersion`; [`ResourceStore::update_status`] presents it and
//! fails with [`Error::Conflict`](crate::Error::Conflict) when it is stale.

mod kubernetes;
mod memory;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};

use crate::error::Result;

/// Get/List/Create/Update over one record kind.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Fetch a record, `None` when it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Records matching an equality label selector (`k=v,k2=v2`).
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>>;

    /// Create a record. Fails with `AlreadyExists` on a name clash.
    async fn create(&self, record: &K) -> Result<K>;

    /// Replace the status of a record, conditional on its version token.
    async fn update_status(&self, record: &K) -> Result<K>;
}

/// `namespace/name` of a record, for logs and error messages.
pub fn record_key<K: Resource>(record: &K) -> String {
    format!(
        "{}/{}",
        record.namespace().unwrap_or_default(),
        record.name_any()
    )
}
