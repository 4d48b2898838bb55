//! Error types for the shepherd supervisor.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the supervisor, its protocol and its client.
#[derive(Error, Debug)]
pub enum Error {
    /// Process (or its standby) is already running
    #[error("Process already running: {0}")]
    AlreadyRunning(String),

    /// Process is not running
    #[error("Process not running: {0}")]
    NotRunning(String),

    /// Operation cannot be performed on this process
    #[error("Not supported for {name}: {reason}")]
    NotSupported { name: String, reason: String },

    /// Target names that are not members of the group
    #[error("No such processes: {}", .0.join(", "))]
    NoSuchProcesses(Vec<String>),

    /// Malformed request argument
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// Too few arguments for a command
    #[error("{command} takes at least {min} argument(s)")]
    TooFewArgs { command: String, min: usize },

    /// Too many arguments for a command
    #[error("{command} takes at most {max} argument(s)")]
    TooManyArgs { command: String, max: usize },

    /// Unknown command name
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Standby exited before reporting readiness
    #[error("Standby for {name} exited before becoming ready (code {code:?})")]
    StandbyFailed { name: String, code: Option<i32> },

    /// Process spawn error
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// PID file has unexpected content
    #[error("Invalid PID file {path}: {reason}")]
    PidFileCorrupt { path: PathBuf, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Control socket is bound by a live master
    #[error("Control socket already in use: {0}")]
    SocketInUse(PathBuf),

    /// Self-restart could not be carried out
    #[error("Master restart aborted: {0}")]
    RestartAborted(String),

    /// Malformed self-restart handoff record
    #[error("Invalid handoff record: {0}")]
    HandoffCorrupt(String),

    /// Error answer received from a remote master
    #[error("{code}: {message}")]
    Remote { code: String, message: String },

    /// Unexpected bytes on the control connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Wire code sent as the second word of an `ERROR` answer.
    pub fn code(&self) -> &'static str {
        match self {
            Error::AlreadyRunning(_) => "ALREADY_RUNNING",
            Error::NotRunning(_) => "NOT_RUNNING",
            Error::NotSupported { .. } => "NOT_SUPPORTED",
            Error::NoSuchProcesses(_) => "NXPROCS",
            Error::Syntax(_) => "SYNTAX",
            Error::TooFewArgs { .. } => "TFARGS",
            Error::TooManyArgs { .. } => "TMARGS",
            Error::UnknownCommand(_) => "NXCMD",
            Error::StandbyFailed { .. } => "STANDBY_FAILED",
            Error::ProcessSpawnFailed(_) => "SPAWN_FAILED",
            Error::RestartAborted(_) => "UNK",
            _ => "INTERNAL",
        }
    }

    /// Whether the error is an unexpected failure whose details stay local.
    pub fn is_internal(&self) -> bool {
        self.code() == "INTERNAL"
    }

    /// Build the error from an `ERROR <code> <message>` answer.
    pub fn from_remote(code: &str, message: &str) -> Self {
        Error::Remote {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}
