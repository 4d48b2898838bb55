//! Supervisor configuration loaded from TOML.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

/// Default path for the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/shepherd/control.sock";

/// Default directory for process PID files
pub const DEFAULT_RUN_DIR: &str = "/run/shepherd";

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Control socket path
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
    /// PID file of the master itself
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Directory for default PID file locations
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    /// Supervised processes, in group order
    #[serde(default, rename = "process")]
    pub processes: Vec<ProcessConfig>,
}

fn default_socket() -> PathBuf {
    PathBuf::from(DEFAULT_CONTROL_SOCKET)
}

fn default_run_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RUN_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            pid_file: None,
            run_dir: default_run_dir(),
            processes: Vec::new(),
        }
    }
}

/// Command line of a process, either a whitespace-separated string or a
/// list of words.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Line(String),
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandLine::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            CommandLine::Argv(words) => words.clone(),
        }
    }
}

/// Definition of one supervised process.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    /// Unique name within the group
    pub name: String,
    /// Command to execute
    pub command: CommandLine,
    /// Environment overrides merged onto the host environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Standard input: inherit, null, file:/path
    #[serde(default = "default_stdin")]
    pub stdin: Redirection,
    /// Standard output: inherit, null, file:/path, append:/path
    #[serde(default)]
    pub stdout: Redirection,
    /// Standard error: inherit, null, file:/path, append:/path
    #[serde(default)]
    pub stderr: Redirection,
    /// Pause after an asynchronous stop, in milliseconds
    #[serde(default, with = "millis_serde")]
    pub stop_delay: Duration,
    /// Extra argument given to a warm standby; `{id}` is replaced with the
    /// instance id and `{socket}` with the control socket path
    #[serde(default)]
    pub notify_arg: Option<String>,
    /// Active PID file, defaults to `<run_dir>/<name>.pid`
    #[serde(default)]
    pub pid_file: PathBuf,
    /// Standby PID file, defaults to `<run_dir>/<name>.standby.pid`
    #[serde(default)]
    pub standby_pid_file: PathBuf,
}

fn default_stdin() -> Redirection {
    Redirection::Null
}

impl ProcessConfig {
    /// Create a process definition with minimal configuration.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: CommandLine::Line(command.into()),
            env: HashMap::new(),
            work_dir: None,
            stdin: default_stdin(),
            stdout: Redirection::default(),
            stderr: Redirection::default(),
            stop_delay: Duration::ZERO,
            notify_arg: None,
            pid_file: PathBuf::new(),
            standby_pid_file: PathBuf::new(),
        }
    }

    /// Fill in PID file paths left empty.
    pub fn with_defaults(mut self, run_dir: &Path) -> Self {
        if self.pid_file.as_os_str().is_empty() {
            self.pid_file = run_dir.join(format!("{}.pid", self.name));
        }
        if self.standby_pid_file.as_os_str().is_empty() {
            self.standby_pid_file = run_dir.join(format!("{}.standby.pid", self.name));
        }
        self
    }

    fn validate(&self) -> Result<()> {
        let bad = |reason: String| Err(Error::ConfigError(format!("{}: {}", self.name, reason)));

        if self.name.is_empty()
            || self.name.contains('=')
            || self.name.chars().any(char::is_whitespace)
        {
            return Err(Error::ConfigError(format!(
                "invalid process name {:?}",
                self.name
            )));
        }
        if self.command.argv().is_empty() {
            return bad("empty command".to_string());
        }
        if let Some(ref arg) = self.notify_arg {
            if !arg.contains("{id}") {
                return bad(format!("notify_arg {:?} lacks {{id}}", arg));
            }
        }
        if self.pid_file == self.standby_pid_file {
            return bad("pid_file and standby_pid_file are the same".to_string());
        }
        Ok(())
    }
}

impl Config {
    /// Load the configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))?;
        content.parse()
    }

    /// Apply defaults and check the definitions against each other.
    fn finish(mut self) -> Result<Self> {
        let run_dir = self.run_dir.clone();
        self.processes = self
            .processes
            .into_iter()
            .map(|p| p.with_defaults(&run_dir))
            .collect();

        let mut names = HashSet::new();
        let mut pid_files = HashSet::new();
        for process in &self.processes {
            process.validate()?;
            if !names.insert(process.name.as_str()) {
                return Err(Error::ConfigError(format!(
                    "duplicate process name {:?}",
                    process.name
                )));
            }
            for path in [&process.pid_file, &process.standby_pid_file] {
                if !pid_files.insert(path.as_path()) {
                    return Err(Error::ConfigError(format!(
                        "PID file {} used twice",
                        path.display()
                    )));
                }
            }
        }

        Ok(self)
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.finish()
    }
}

/// Which standard stream a redirection applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

/// Where a standard stream of a child points.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Redirection {
    /// Share the supervisor's stream
    #[default]
    Inherit,
    /// `/dev/null`
    Null,
    /// A file, truncated or appended to when written
    File { path: PathBuf, append: bool },
}

impl Redirection {
    /// Open the target for the duration of one spawn.
    pub fn open(&self, stream: Stream) -> Result<Stdio> {
        let (path, append) = match self {
            Redirection::Inherit => return Ok(Stdio::inherit()),
            Redirection::Null => return Ok(Stdio::null()),
            Redirection::File { path, append } => (path, *append),
        };

        let file: File = if stream == Stream::Stdin {
            File::open(path)?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(path)?
        };
        Ok(Stdio::from(file))
    }
}

impl FromStr for Redirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inherit" => Ok(Redirection::Inherit),
            "null" => Ok(Redirection::Null),
            _ => {
                if let Some(path) = s.strip_prefix("file:") {
                    Ok(Redirection::File {
                        path: PathBuf::from(path),
                        append: false,
                    })
                } else if let Some(path) = s.strip_prefix("append:") {
                    Ok(Redirection::File {
                        path: PathBuf::from(path),
                        append: true,
                    })
                } else {
                    Err(Error::ConfigError(format!("invalid redirection {:?}", s)))
                }
            }
        }
    }
}

impl TryFrom<String> for Redirection {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Module for millisecond duration serialization.
mod millis_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
