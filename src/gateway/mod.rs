//! Admission decisions over the current rule snapshot.

mod admission;
mod decision;

pub use admission::Gateway;
pub use decision::{Decision, ReasonCode, UsageReport};
