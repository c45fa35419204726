//! The database connection-supplier capability (spec §1, §4.4). The
//! driver and pooling are out of scope; the coordinator only needs to
//! lazily obtain a connection, commit or roll it back, and close it.

use std::any::Any;

use async_trait::async_trait;

/// One database connection, opened with auto-commit off, tracked by the
/// coordinator for the duration of a single stage invocation. The
/// driver-specific query surface is out of scope for this trait (§1) —
/// `as_any`/`as_any_mut` let user code downcast to its own concrete
/// connection type to actually run queries, while the coordinator only
/// ever calls the three lifecycle methods below.
#[async_trait]
pub trait DbConnection: Send + Sync {
    async fn commit(&mut self) -> anyhow::Result<()>;
    async fn rollback(&mut self) -> anyhow::Result<()>;
    async fn close(&mut self) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Obtains connections on demand. The coordinator calls `connect` at
/// most once per stage invocation, and only if the processor lambda
/// actually asks for a connection (spec §4.4 step 3: "If the processing
/// lambda makes the database connection observable").
#[async_trait]
pub trait DbConnectionSupplier: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Box<dyn DbConnection>>;
}
