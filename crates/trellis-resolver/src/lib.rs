//! The resolution engine for Trellis.
//!
//! Pure computation over supplied inputs: given an Extension spec, the
//! currently installed bundle fact, and the catalog's bundles for the
//! package, select the bundle to install or fail with a typed error. No I/O
//! happens here; the reconciler supplies everything.

#![deny(missing_docs)]

mod graph;
mod resolver;

pub use graph::SuccessorGraph;
pub use resolver::{resolve, Resolution, ResolveError};
