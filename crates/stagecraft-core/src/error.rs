//! Error taxonomy for the stage runtime and transaction coordinator.
//!
//! The kinds mirror the failure model a stage can hit: a message the
//! processor itself rejects, an unhandled failure in processor code, a
//! codec failure at either boundary, and a database or broker failure at
//! a specific operation. Every kind causes the same outer decision —
//! roll back — but callers (and logs) care which one fired.

use std::fmt;

/// Database operation a [`StageError::Database`] failed during.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbOp {
    Connect,
    Commit,
    Rollback,
    Close,
}

impl fmt::Display for DbOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DbOp::Connect => "connect",
            DbOp::Commit => "commit",
            DbOp::Rollback => "rollback",
            DbOp::Close => "close",
        };
        f.write_str(s)
    }
}

/// Broker operation a [`StageError::Broker`] failed during.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerOp {
    Receive,
    Send,
    Commit,
    Rollback,
}

impl fmt::Display for BrokerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BrokerOp::Receive => "receive",
            BrokerOp::Send => "send",
            BrokerOp::Commit => "commit",
            BrokerOp::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Every way a single stage invocation can fail to produce a committed
/// outcome. See spec §7 for the taxonomy this enum realizes.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The processor explicitly signaled the message is unprocessable.
    #[error("message refused: {0}")]
    Refused(String),

    /// The processor lambda returned or panicked with an unhandled error.
    #[error("processor failure: {0}")]
    UserFailure(#[source] anyhow::Error),

    /// Inbound decode or outbound encode failed.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// A database operation failed.
    #[error("database {op} failed: {source}")]
    Database {
        op: DbOp,
        #[source]
        source: anyhow::Error,
    },

    /// A broker operation failed.
    #[error("broker {op} failed: {source}")]
    Broker {
        op: BrokerOp,
        #[source]
        source: anyhow::Error,
    },

    /// More than one of request/reply/next was invoked in a single stage.
    #[error("a stage may produce at most one outgoing message")]
    MultipleOutgoing,

    /// request() was called on a stage with no following stage, or
    /// similar "this call is not valid here" misuse.
    #[error("invalid dispatch: {0}")]
    InvalidDispatch(String),

    /// The coordinator's scope exited along an unaccounted path: neither
    /// the success arm nor the error arm observed completion. This is a
    /// bug in the runtime, not in user code.
    #[error("internal invariant violation: {0}")]
    InvariantViolation(String),
}

impl StageError {
    pub fn refused(msg: impl Into<String>) -> Self {
        Self::Refused(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn database(op: DbOp, source: impl Into<anyhow::Error>) -> Self {
        Self::Database {
            op,
            source: source.into(),
        }
    }

    pub fn broker(op: BrokerOp, source: impl Into<anyhow::Error>) -> Self {
        Self::Broker {
            op,
            source: source.into(),
        }
    }

    /// Whether this error kind is treated like a user/refuse failure for
    /// transaction purposes (§7.2: "Treated like refuse-message").
    pub fn is_rollback_cause(&self) -> bool {
        true // every StageError variant rolls back; kept as a named predicate
             // so call sites read as intent rather than "always true".
    }
}

pub type StageResult<T> = Result<T, StageError>;
