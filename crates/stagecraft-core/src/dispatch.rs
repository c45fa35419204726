//! The type-erased shape every stage is reduced to at construction time
//! (spec §9: "implementations should favor... rather than rely on
//! language-level reflection"). `EndpointBuilder::stage` (see
//! `crate::endpoint`) is the only place a concrete `Incoming`/`State`/
//! `Serializer` triple exists; everything downstream of it — `Stage`,
//! `Endpoint`, `Factory` — only ever holds this erased closure, which is
//! what keeps those types free of generic parameters.

use futures::future::BoxFuture;

use crate::context::StageContext;
use crate::error::StageResult;

/// Consumes an untyped [`StageContext`] (already carrying the decoded
/// incoming trace) and returns it back populated with whatever the
/// stage decided to send, or a [`crate::error::StageError`] if the
/// processor failed.
pub type StageDispatch = std::sync::Arc<dyn Fn(StageContext) -> BoxFuture<'static, StageResult<StageContext>> + Send + Sync>;
