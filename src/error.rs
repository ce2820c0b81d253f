//! Error types for the cache worker set controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CacheWorkerSet specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A bookkeeping invariant did not hold; fatal for the current pass
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The cache-drain hook refused or failed to release a pod
    #[error("cache drain failed for pod {pod}: {message}")]
    Drain {
        /// Pod that could not be drained
        pod: String,
        /// Failure reported by the hook
        message: String,
    },

    /// A looked-up object does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Object is missing a required metadata field
    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an invariant violation with the given message
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create a drain failure for the given pod
    pub fn drain(pod: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Drain {
            pod: pod.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error describing the missing object
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    fn api_response(&self) -> Option<&kube::core::ErrorResponse> {
        match self {
            Self::Kube(kube::Error::Api(response)) => Some(response),
            _ => None,
        }
    }

    /// The object being read, updated or deleted is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_)) || self.api_response().is_some_and(|e| e.code == 404)
    }

    /// A create collided with an existing object of the same name
    pub fn is_already_exists(&self) -> bool {
        self.api_response()
            .is_some_and(|e| e.code == 409 && e.reason == "AlreadyExists")
    }

    /// An optimistic-concurrency precondition (resourceVersion) failed
    pub fn is_conflict(&self) -> bool {
        self.api_response()
            .is_some_and(|e| e.code == 409 && e.reason != "AlreadyExists")
    }

    /// Build an API error as the apiserver would return it
    #[cfg(test)]
    pub(crate) fn api(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Self::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: message.into(),
            reason: reason.to_string(),
            code,
        }))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
