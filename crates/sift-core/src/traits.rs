use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Language model: one prompt in, one completion out.
///
/// When `request.schema` is set the implementation runs in strict mode: the
/// completion must parse as JSON matching the schema, otherwise the call
/// fails with `SchemaMismatch`/`LlmParse` instead of returning a guess.
pub trait LanguageModel: Send + Sync + 'static {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>>;

    /// Model identifier for logs and run metadata.
    fn name(&self) -> &str {
        "unknown"
    }
}

/// Domain services backing the strategies (mail, calendar, contacts, chat).
pub trait DomainService: Send + Sync + 'static {
    /// Items matching structural attributes.
    fn filter_by_metadata(&self, criteria: MetadataCriteria) -> BoxFuture<'_, Result<Vec<Item>>>;

    /// Items whose text matches a keyword query.
    fn search_by_keyword(&self, query: KeywordQuery) -> BoxFuture<'_, Result<Vec<Item>>>;

    /// Full threads for a batch of ids, in one round trip.
    fn read_threads_batch(&self, ids: Vec<String>) -> BoxFuture<'_, Result<Vec<Thread>>>;
}
