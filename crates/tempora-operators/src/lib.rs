#![forbid(unsafe_code)]
//! tempora-operators: the operator contract and the operators built on it.
//!
//! Operators are push-based observers. A batch handed to `on_next` becomes
//! the callee's responsibility: it forwards it, keeps it, or frees it.
//! Every operator forwards punctuations (possibly transformed) because
//! downstream state eviction depends on them.
//!
//! - `ingress` / `egress` convert between external events and batches.
//! - `filter`, `multicast`, `union` are the plumbing operators.
//! - `window` holds the hopping-window aggregate.
//! - `punctuation` has the disorder guard and the two-input punctuation merge.

pub mod binary;
pub mod egress;
pub mod filter;
pub mod ingress;
pub mod multicast;
pub mod plan;
pub mod punctuation;
#[cfg(test)]
mod testing;
pub mod traits;
pub mod union;
pub mod window;

pub use binary::{BinaryInput, Side};
pub use egress::{Change, Egress, EgressMode};
pub use filter::Where;
pub use ingress::{Ingress, StreamEvent};
pub use multicast::Multicast;
pub use plan::PlanNode;
pub use punctuation::{Admission, DisorderGuard, PeriodicPunctuation, PunctuationMerger};
pub use traits::{BinaryObserver, Observer, Pipe};
pub use union::{DisjointUnion, UnionMode};
pub use window::{Aggregate, Average, Count, HoppingWindow, Sum};
