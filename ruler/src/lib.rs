#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Ruler implements the audit/event rule evaluation pipeline: HTTP
//! ingress for record batches, a bounded worker pool that matches
//! records against the loaded rule set, and an exporter hub that
//! fans fired alerts out to the configured receivers.

/// Prelude is the common imports for the pipeline modules.
pub(crate) mod prelude {
    pub use std::collections::BTreeMap;
    pub use std::sync::Arc;

    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{Map, Value};
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use crate::{Error, Result};
}

pub mod exporter;
pub mod flatten;
pub mod loader;
pub mod matcher;
pub mod record;
pub mod rules;
pub mod webhook;
pub mod worker;

/// Error ...
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// TracingConfig indicates the error came from the tracing setup.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates the error came from installing the tracing subscriber.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Kube is a generic error from the `kube` crate.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig indicates the process was unable to find a kubeconfig.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    /// Io indicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON indicates a JSON serialization failed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// YAML indicates a YAML deserialization failed.
    #[error("yaml error: {0}")]
    YAML(#[from] serde_yaml::Error),
    /// AddrParse indicates the provided string failed to parse into an address.
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    /// Tokio indicates an error joining tasks.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    /// Http indicates an outbound request failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// InvalidRule indicates a rule failed resolution or validation.
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    /// Receiver indicates an unusable receiver configuration.
    #[error("receiver config error: {0}")]
    Receiver(String),
    /// Other is a catch-all error.
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result typedef for the pipeline.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// RULER_NAME is the name the service uses whenever it needs a
/// human-readable name; it is also the default name of the receiver
/// ConfigMap.
pub const RULER_NAME: &str = "telemetry-ruler";

/// DEFAULT_NAMESPACE is where the receiver ConfigMap lives when the
/// `NAMESPACE` environment variable is unset.
pub const DEFAULT_NAMESPACE: &str = "kubesphere-logging-system";

/// CONFIGMAP_KEY is the ConfigMap key holding the receiver document.
pub const CONFIGMAP_KEY: &str = "config";

/// WORKSPACE_LABEL is the namespace label ingress copies into
/// records that arrive without a workspace.
pub const WORKSPACE_LABEL: &str = "kubesphere.io/workspace";

/// Namespace reports the configuration namespace from the
/// environment, falling back to [`DEFAULT_NAMESPACE`].
pub fn namespace() -> String {
    std::env::var("NAMESPACE")
        .ok()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}
