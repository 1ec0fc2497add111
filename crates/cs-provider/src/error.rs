#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("unsupported interface version {0:?}")]
    UnsupportedInterface(String),

    #[error("failed to read stdin: {0}")]
    Stdin(#[from] std::io::Error),

    #[error("invalid input: {0}")]
    Input(#[from] serde_json::Error),

    #[error(transparent)]
    Provider(#[from] cs_infra::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
