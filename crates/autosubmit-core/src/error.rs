use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutosubmitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AutosubmitError>;
