//! Error types for the Trellis operator
//!
//! Errors are structured with fields to aid debugging in production. Domain
//! failures (resolution, unpack, installation) are surfaced to users through
//! status conditions; the variants here classify them for retry cadence.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Trellis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {extension}: {message}")]
    Validation {
        /// Name of the extension with invalid configuration
        extension: String,
        /// Description of what's invalid
        message: String,
    },

    /// Catalog index error (listing catalogs, fetching or parsing content)
    #[error("catalog error [{catalog}]: {message}")]
    Catalog {
        /// Name of the catalog involved, or "unknown"
        catalog: String,
        /// Description of what failed
        message: String,
    },

    /// Bundle content retrieval failed
    #[error("unpack error for bundle {bundle}: {message}")]
    Unpack {
        /// Name of the bundle being unpacked
        bundle: String,
        /// Description of what failed
        message: String,
    },

    /// Applying bundle content to the cluster failed
    #[error("{message}")]
    Installation {
        /// The installer's error text, propagated verbatim to the
        /// Installed condition
        message: String,
    },

    /// The resolved bundle declares a dependency kind we do not support
    #[error("bundle {bundle:?} has a dependency declared via property {property:?} which is currently not supported")]
    UnsupportedDependency {
        /// Name of the offending bundle
        bundle: String,
        /// The dependency property type (e.g. "olm.package.required")
        property: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "reconciler", "unpacker")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            extension: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with extension context
    pub fn validation_for(extension: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            extension: extension.into(),
            message: msg.into(),
        }
    }

    /// Create a catalog error without a specific catalog context
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog {
            catalog: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a catalog error for a specific catalog
    pub fn catalog_for(catalog: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Catalog {
            catalog: catalog.into(),
            message: msg.into(),
        }
    }

    /// Create an unpack error for a specific bundle
    pub fn unpack_for(bundle: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Unpack {
            bundle: bundle.into(),
            message: msg.into(),
        }
    }

    /// Create an installation error; the message is shown to users verbatim
    pub fn installation(msg: impl Into<String>) -> Self {
        Self::Installation {
            message: msg.into(),
        }
    }

    /// Create an unsupported-dependency error for a bundle/property pair
    pub fn unsupported_dependency(
        bundle: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        Self::UnsupportedDependency {
            bundle: bundle.into(),
            property: property.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Whether this error is an optimistic-concurrency conflict (HTTP 409).
    ///
    /// Conflicts are retried immediately with freshly reloaded state and are
    /// never surfaced through status conditions.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 409
        )
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors require a spec or code change and
    /// are not retried. Unsupported dependencies are terminal for the current
    /// resolution but the object as a whole keeps being retried, since
    /// catalog content may change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors; conflicts are retried
                // immediately by the caller, other 4xx are not retried.
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Validation { .. } => false,
            Error::Catalog { .. } => true,
            Error::Unpack { .. } => true,
            Error::Installation { .. } => true,
            Error::UnsupportedDependency { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether failures of this kind requeue on the slow cadence.
    ///
    /// Resolution-class failures typically require a catalog or spec change
    /// to clear, so they are polled less aggressively than transient unpack
    /// or installation failures.
    pub fn is_slow_retry(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedDependency { .. } | Error::Catalog { .. }
        )
    }
}
