//! Shepherd - process supervisor and remote-control daemon.
//!
//! A single master process starts, stops, warm-restarts and reports on a
//! configured set of child processes. It handles:
//!
//! - Process lifecycle (start, stop, restart, status)
//! - Warm restarts: a standby instance reports readiness over the control
//!   socket and is promoted in place of the running one
//! - PID files that keep track of children across supervisor restarts
//! - A line-based control protocol over a Unix socket
//! - Replacing the master's own image without losing its children
//!
//! # Architecture
//!
//! - **Scheduler**: single-threaded cooperative executor all routines of a
//!   master run on
//! - **Process / ProcessGroup**: the supervised units and the operations
//!   fanning out over them
//! - **PidFile**: durable record of which OS process runs a slot
//! - **Remote protocol**: wire format, command registry, client
//! - **Master**: accept loop, global mutation lock, self-restart handoff
//!
//! # Example
//!
//! ```no_run
//! use shepherd::{run_master, Config, MasterConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("/etc/shepherd.toml".as_ref())?;
//!     run_master(MasterConfig::new(config))?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod group;
pub mod handoff;
pub mod master;
pub mod pidfile;
pub mod process;
pub mod remote;
pub mod sched;

// Re-export main types
pub use config::{Config, ProcessConfig, Redirection};
pub use error::{Error, Result};
pub use group::{GroupResult, OpOptions, Operation, ProcessGroup, Reporter};
pub use master::{run_master, ControlServer, Master, MasterConfig};
pub use pidfile::PidFile;
pub use process::{LiveHandle, Process, Readiness};
pub use remote::ControlClient;
pub use sched::Scheduler;
