//! CloudStack runner provider core.
//!
//! Resolves runner bootstrap requests into CloudStack deployment specs and
//! manages the lifecycle of the resulting virtual machines.

pub mod config;
pub mod instance;
pub mod platform;
pub mod provider;
pub mod resolve;
pub mod spec;
pub mod types;
pub mod userdata;

pub use config::ProviderConfig;
pub use instance::InstanceManager;
pub use platform::Platform;
pub use provider::CloudStackProvider;
pub use resolve::{ResolvedIdentifiers, is_identifier};
pub use spec::{ExtraSpecs, NfsMount, RunnerSpec, SpecBuilder, ToolFetcher};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to resolve {field} {value:?}: {source}")]
    Resolution {
        field: &'static str,
        value: String,
        source: Box<Error>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous: {0}")]
    Ambiguous(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("cloudstack error: {0}")]
    Platform(#[from] cloudstack_api::Error),

    #[error("user data error: {0}")]
    UserData(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether an error means the target resource does not exist.
///
/// CloudStack has no structured not-found code; the API reports it as
/// "No match found for ..." or "... entity does not exist" in the error text.
/// Async timeouts never count, even if the job text mentions a missing entity.
pub fn is_not_found_error(err: &Error) -> bool {
    match err {
        Error::NotFound(_) => true,
        Error::Platform(cloudstack_api::Error::AsyncTimeout { .. }) => false,
        Error::Platform(inner) => {
            let text = inner.to_string().to_lowercase();
            text.contains("no match found for") || text.contains("entity does not exist")
        }
        _ => false,
    }
}
