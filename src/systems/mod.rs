//! Reference diff algebras
//!
//! Small, complete document types used by the demo and the test suite, and
//! as worked examples for writing new [`OtSystem`](crate::ot::OtSystem)
//! implementations.

pub mod counter;
pub mod dict;

pub use counter::{CounterDiff, CounterState, CounterSystem};
pub use dict::{DictDiff, DictState, DictSystem};
