//! Testing utilities and mock implementations
//!
//! Mocks for the controller, the blob store and handlers, so the task cycle
//! can be tested without a running controller or object store.

pub mod mocks;

pub use mocks::*;
