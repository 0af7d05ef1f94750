//! Controller protocol types
//!
//! Tasks served by the controller and the result payloads reported back.

pub mod result;
pub mod task;

pub use result::*;
pub use task::*;
