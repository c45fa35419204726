//! In-memory broker, database, and serializer test doubles for
//! `stagecraft-core`. Nothing here is production-grade; each double
//! exists to make every invariant in the core crate's spec exercisable
//! without a running broker or database.

pub mod broker;
pub mod db;
pub mod serializer;

pub use broker::InMemoryBrokerFactory;
pub use db::{FakeDbConnection, FakeDbFailures, FakeDbSupplier};
pub use serializer::JsonSerializer;
