use crate::error::Result;
use crate::types::{Candidate, TitleDetails};
use async_trait::async_trait;
use sf_catalog::Kind;

#[async_trait]
pub trait MetadataLookup: Send + Sync {
    /// Ranked candidates for a free-text query. Callers cap the list themselves.
    async fn search(&self, query: &str, kind: Kind) -> Result<Vec<Candidate>>;

    /// Full detail for one candidate; shows include their season skeleton.
    async fn details(&self, external_id: i64, kind: Kind) -> Result<TitleDetails>;
}
