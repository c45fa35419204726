//! Workspace root — carries no library code.
//!
//! `stagecraft` the library lives in `crates/stagecraft-core`. This crate
//! exists so the workspace has a place for end-to-end examples
//! (`examples/three_level_stack.rs`) that exercise the full `Factory` ->
//! `Endpoint` -> `Stage` -> `Initiator` wiring against the in-memory test
//! doubles in `stagecraft-testkit`, without those doubles leaking into
//! `stagecraft-core`'s own dependency tree as a non-dev dependency.
