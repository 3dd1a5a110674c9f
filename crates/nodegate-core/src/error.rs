use thiserror::Error;

/// Errors produced by the nodegate subsystem.
///
/// Admission rejections and pool exhaustion are not errors; they are
/// reported as verdicts by the server crate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("config error: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("bind failed: {0}")]
    Bind(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type GateResult<T> = Result<T, GateError>;
