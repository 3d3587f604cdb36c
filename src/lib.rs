use thiserror::Error;

/// Expose all controller components used by main
pub mod operator;
pub mod resources;

/// Database-backed lifecycle of bindings and instances
pub mod cluster;
pub mod event;
pub mod facade;
pub mod model;
pub mod processor;
pub mod store;

/// HTTP surface translating requests into facade calls
pub mod api;

/// Process settings read from the environment
pub mod config;

// Internal only
mod reconcilers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Namespace every `ServicePackage` lives in.
pub const SYSTEM_NAMESPACE: &str = "kappital-system";

/// Cluster identifier used when a request does not name one.
pub const DEFAULT_CLUSTER: &str = "default";

/// Namespace used for user resources when a request does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Field manager and event reporter name.
pub const MANAGER_NAME: &str = "kappital-engine";

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Base64Error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Database Error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("IllegalServicePackage: {0}")]
    IllegalServicePackage(String),

    #[error("ValidationError: {0}")]
    ValidationError(String),

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("ServiceInstallError: {0}")]
    ServiceInstallError(String),

    #[error("ServiceDeleteError: {0}")]
    ServiceDeleteError(String),

    #[error("InstanceCreateError: {0}")]
    InstanceCreateError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("CrdError: {0}")]
    CrdError(String),

    #[error("ConfigError: {0}")]
    ConfigError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        let label = format!("{self:?}");
        label
            .split(|c: char| !c.is_alphanumeric())
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }

    /// Whether the error means the addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            Error::DatabaseError(sqlx::Error::RowNotFound) => true,
            _ => false,
        }
    }

    /// Whether the error was caused by an object that already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }

    /// Whether an insert hit a unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::DatabaseError(sqlx::Error::Database(e)) => e.is_unique_violation(),
            _ => false,
        }
    }

    /// Errors that retrying cannot fix: bad input or undecodable stored data.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ValidationError(_)
                | Error::SerializationError(_)
                | Error::YamlError(_)
                | Error::Base64Error(_)
                | Error::IllegalServicePackage(_)
        )
    }
}
