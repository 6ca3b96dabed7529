use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimpleCmdError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set up output capture: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Process exited with status {code}")]
    Exit { code: i32 },

    #[error("Process terminated by signal {signal}")]
    Signal { signal: i32 },

    #[error("Failed to kill process: {0}")]
    Kill(#[source] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SimpleCmdError {
    /// Exit code carried by the error, if the process actually exited.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SimpleCmdError::Exit { code } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SimpleCmdError>;
