//! Common types for Trellis: CRDs, conditions, errors, and utilities

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for all server-side apply operations
pub const FIELD_MANAGER: &str = "trellis-operator";

/// Finalizer that defers Extension deletion until teardown has completed
pub const TEARDOWN_FINALIZER: &str = "trellis.dev/teardown";

/// Label key identifying the managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value identifying resources managed by Trellis
pub const LABEL_MANAGED_BY_TRELLIS: &str = "trellis";

/// Label key linking an applied resource back to its Extension
pub const LABEL_EXTENSION: &str = "trellis.dev/extension";

/// Requeue interval after a fully successful reconcile (periodic resync)
pub const REQUEUE_SUCCESS_SECS: u64 = 300;

/// Requeue interval while waiting for an in-progress unpack (bounded poll)
pub const REQUEUE_UNPACK_PENDING_SECS: u64 = 10;
