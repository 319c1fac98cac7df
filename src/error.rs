use thiserror::Error;

/// Errors surfaced by the fallwatch library.
///
/// The tracker, classifier and escalation engine never fail; these cover
/// configuration, the link codec and cloud delivery around them.
#[derive(Error, Debug)]
pub enum FallwatchError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Link decode failed: {0}")]
    LinkDecode(String),

    #[error("Link encode failed: {0}")]
    LinkEncode(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Session file error: {0}")]
    Session(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FallwatchError>;
