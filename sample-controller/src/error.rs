use std::time::Duration;

use thiserror::Error;

/// Errors raised by the controller
#[derive(Debug, Error)]
pub enum Error {
    /// Creating the managed Deployment was rejected
    #[error("failed to create deployment {name}: {source}")]
    CreateDeployment {
        /// Name of the Deployment
        name: String,
        /// Error returned by the API server
        #[source]
        source: kube::Error,
    },

    /// Replacing a drifted Deployment was rejected
    #[error("failed to update deployment {name}: {source}")]
    UpdateDeployment {
        /// Name of the Deployment
        name: String,
        /// Error returned by the API server
        #[source]
        source: kube::Error,
    },

    /// Writing the status subresource was rejected
    #[error("failed to update status of foo {name}: {source}")]
    UpdateFooStatus {
        /// Name of the Foo
        name: String,
        /// Error returned by the API server
        #[source]
        source: kube::Error,
    },

    /// The status update body could not be encoded
    #[error("failed to serialize foo {name}: {source}")]
    SerializeFoo {
        /// Name of the Foo
        name: String,
        /// Encoding error
        #[source]
        source: serde_json::Error,
    },

    /// A Deployment with the requested name exists but is controlled by something else
    #[error("deployment {deployment} already exists and is not controlled by foo {foo}")]
    NotOwned {
        /// Name of the Deployment
        deployment: String,
        /// `namespace/name` of the Foo asking for it
        foo: String,
    },

    /// A required metadata field was not set
    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),

    /// The kubeconfig file could not be read or used
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[source] kube::config::KubeconfigError),

    /// Neither a kubeconfig nor an in-cluster environment was usable
    #[error("failed to infer cluster config: {0}")]
    InferConfig(#[source] kube::config::InferConfigError),

    /// The client could not be built from a loaded config
    #[error("failed to build kubernetes client: {0}")]
    BuildClient(#[source] kube::Error),

    /// The informers did not complete their initial list in time
    #[error("timed out after {0:?} waiting for caches to sync")]
    CacheSyncTimeout(Duration),

    /// Shutdown was requested before the informers completed their initial list
    #[error("failed to wait for caches to sync")]
    CacheSyncAborted,

    /// [`Lifecycle::install_signal_handler`](crate::signals::Lifecycle::install_signal_handler) was called twice
    #[error("shutdown signal handler already installed")]
    SignalHandlerInstalled,

    /// The OS refused the signal registration
    #[error("failed to register shutdown signal handler: {0}")]
    SignalHandler(#[source] std::io::Error),
}

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the work item that produced this error should be requeued
    ///
    /// Ownership conflicts and malformed objects do not heal by retrying,
    /// they need a change to the Foo or the Deployment first.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::NotOwned { .. } | Error::MissingObjectKey(_))
    }
}
