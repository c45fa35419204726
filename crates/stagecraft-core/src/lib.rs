//! Core for staged, stateless, transactional, message-driven services.
//!
//! A service is an ordered sequence of [`stage`]s. Each stage consumes a
//! message from a logical queue, may perform I/O, and typically emits
//! exactly one message. Flow between stages — and between different
//! services — proceeds by request/reply semantics reified into a
//! [`trace::Trace`] that rides along with every message, giving the
//! illusion of a synchronous call stack despite every stage running on
//! its own worker, on possibly a different node, from the one before it.
//!
//! This crate implements three tightly coupled subsystems:
//!
//! - [`trace`] — the flow envelope: call chain, frame-state stack,
//!   properties, single-hop sideband payloads.
//! - [`stage`]/[`endpoint`]/[`factory`]/[`initiator`] — the stage
//!   runtime: per-stage concurrency, endpoint composition, the
//!   endpoint registry, and the flow-starting entry point.
//! - [`coordinator`] — the Best-Effort-One-Phase-Commit transaction
//!   coordinator binding one broker transaction to an optional database
//!   transaction per stage invocation.
//!
//! The broker client, database driver, and payload codec are external
//! collaborators: this crate only requires the trait surfaces in
//! [`broker`], [`db`], and [`serializer`]. `stagecraft-testkit` ships
//! in-memory implementations of all three for tests.

pub mod broker;
pub mod context;
pub mod coordinator;
pub mod db;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod initiator;
pub mod resilience;
pub mod serializer;
pub mod stage;
pub mod trace;

pub use context::{StageContext, TypedStageContext};
pub use coordinator::{ScopeHandle, ScopeOutcome, TransactionCoordinator};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointCollaborators, EndpointRuntime};
pub use error::{BrokerOp, DbOp, StageError, StageResult};
pub use factory::{Factory, FactoryConfig};
pub use initiator::{InitiateContext, Initiator, TypedInitiateContext};
pub use stage::{Stage, StageConfig};
pub use trace::{Call, CallType, EncodedValue, StackFrame, Trace};
