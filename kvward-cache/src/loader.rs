//! Durable-store access supplied by the caller.

use async_trait::async_trait;
use kvward_core::LoaderError;

/// Fetches a record from the durable store on a cache miss.
///
/// `Ok(None)` means the record does not exist, which the cache remembers
/// with the empty sentinel. `Err` means the lookup itself failed and nothing
/// is written.
#[async_trait]
pub trait Loader<Id, T>: Send + Sync
where
    Id: Send + Sync,
{
    async fn load(&self, id: &Id) -> Result<Option<T>, LoaderError>;
}
