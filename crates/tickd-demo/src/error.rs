//! Error types for the demo daemon.

#[derive(thiserror::Error, Debug)]
pub enum DemoError {
    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("logging: {0}")]
    Logging(String),

    #[error(transparent)]
    Core(#[from] tickd::CoreError),
}
