//! A fake database connection good enough to exercise the BE-1PC
//! coordinator's success path and each distinct failure kind from
//! spec §7.4 (connect/commit/rollback/close) without a real driver.
//!
//! Rows `insert`ed on a connection are staged; `commit` moves staged
//! rows into the shared, visible table, `rollback` discards them —
//! mirroring what a real transactional connection would do, just
//! in-process.

use std::any::Any;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use stagecraft_core::db::{DbConnection, DbConnectionSupplier};

/// Which operations this supplier's connections should fail, for
/// exercising each distinct [`stagecraft_core::error::DbOp`] in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeDbFailures {
    pub fail_connect: bool,
    pub fail_commit: bool,
    pub fail_rollback: bool,
    pub fail_close: bool,
}

/// Shared backing store for one test's worth of "committed" rows,
/// plus the failure injection every connection it opens will use.
#[derive(Debug, Clone, Default)]
pub struct FakeDbSupplier {
    visible_rows: Arc<Mutex<Vec<String>>>,
    failures: FakeDbFailures,
}

impl FakeDbSupplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failures(failures: FakeDbFailures) -> Self {
        Self {
            visible_rows: Arc::new(Mutex::new(Vec::new())),
            failures,
        }
    }

    /// Rows visible after at least one successful commit. Never
    /// includes rows from a connection that was rolled back.
    pub fn visible_rows(&self) -> Vec<String> {
        self.visible_rows.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl DbConnectionSupplier for FakeDbSupplier {
    async fn connect(&self) -> anyhow::Result<Box<dyn DbConnection>> {
        if self.failures.fail_connect {
            anyhow::bail!("fake database connect failure");
        }
        Ok(Box::new(FakeDbConnection {
            visible_rows: self.visible_rows.clone(),
            staged: Vec::new(),
            failures: self.failures,
        }))
    }
}

/// One checked-out connection. `insert_row` is the only query surface
/// this double exposes — enough to drive the "stage inserts a row,
/// then commits or fails" scenarios in spec §8.
pub struct FakeDbConnection {
    visible_rows: Arc<Mutex<Vec<String>>>,
    staged: Vec<String>,
    failures: FakeDbFailures,
}

impl FakeDbConnection {
    pub fn insert_row(&mut self, value: impl Into<String>) {
        self.staged.push(value.into());
    }
}

#[async_trait]
impl DbConnection for FakeDbConnection {
    async fn commit(&mut self) -> anyhow::Result<()> {
        if self.failures.fail_commit {
            anyhow::bail!("fake database commit failure");
        }
        self.visible_rows
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(std::mem::take(&mut self.staged));
        Ok(())
    }

    async fn rollback(&mut self) -> anyhow::Result<()> {
        if self.failures.fail_rollback {
            anyhow::bail!("fake database rollback failure");
        }
        self.staged.clear();
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.failures.fail_close {
            anyhow::bail!("fake database close failure");
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn committed_row_becomes_visible() {
        let supplier = FakeDbSupplier::new();
        let mut conn = supplier.connect().await.unwrap();
        conn.as_any_mut().downcast_mut::<FakeDbConnection>().unwrap().insert_row("alice");
        conn.commit().await.unwrap();
        assert_eq!(supplier.visible_rows(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn rolled_back_row_never_becomes_visible() {
        let supplier = FakeDbSupplier::new();
        let mut conn = supplier.connect().await.unwrap();
        conn.as_any_mut().downcast_mut::<FakeDbConnection>().unwrap().insert_row("alice");
        conn.rollback().await.unwrap();
        assert!(supplier.visible_rows().is_empty());
    }

    #[tokio::test]
    async fn connect_failure_is_injectable() {
        let supplier = FakeDbSupplier::with_failures(FakeDbFailures {
            fail_connect: true,
            ..Default::default()
        });
        assert!(supplier.connect().await.is_err());
    }

    #[tokio::test]
    async fn commit_failure_is_injectable() {
        let supplier = FakeDbSupplier::with_failures(FakeDbFailures {
            fail_commit: true,
            ..Default::default()
        });
        let mut conn = supplier.connect().await.unwrap();
        assert!(conn.commit().await.is_err());
    }
}
