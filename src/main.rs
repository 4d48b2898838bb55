//! Shepherd binary.
//!
//! Runs the master, or talks to a running one over its control socket.

use clap::{Args, Parser, Subcommand};
use shepherd::group::Reporter;
use shepherd::remote::command::Request;
use shepherd::remote::wire::compose_line;
use shepherd::{run_master, Config, ControlClient, MasterConfig, OpOptions, Operation, ProcessGroup, Scheduler};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "shepherd",
    about = "Process supervisor and remote-control daemon",
    version,
    author
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "SHEPHERD_CONFIG")]
    config: Option<PathBuf>,

    /// Control socket path (overrides the configuration)
    #[arg(short, long, global = true, env = "SHEPHERD_SOCKET")]
    socket: Option<PathBuf>,

    /// Run operations in-process instead of through the master
    #[arg(long, global = true)]
    standalone: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct OpArgs {
    /// Target process names (all if none)
    names: Vec<String>,

    /// Wait for the operation to complete
    #[arg(short, long)]
    wait: bool,

    /// Print progress reports
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master
    RunMaster {
        /// PID file of the master
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Listening descriptor inherited from a previous image
        #[arg(long, hide = true)]
        inherit_listener: Option<RawFd>,

        /// Restore the handoff table from stdout
        #[arg(long, hide = true)]
        restore_handles: bool,

        /// Helper process of the previous image
        #[arg(long, hide = true)]
        handoff_helper: Option<u32>,
    },

    /// Send a raw protocol command
    Cmd {
        /// Command name and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },

    /// Start processes
    Start(OpArgs),

    /// Stop processes
    Stop {
        #[command(flatten)]
        op: OpArgs,

        /// Signal number to terminate with
        #[arg(long)]
        signal: Option<i32>,
    },

    /// Restart processes
    Restart(OpArgs),

    /// Restart processes through a warm standby
    BgRestart(OpArgs),

    /// Spawn warm standbys
    Warmup(OpArgs),

    /// Show process status
    Status(OpArgs),

    /// Report readiness of a warming standby
    Notify {
        /// Instance id handed to the standby
        #[arg(env = "SHEPHERD_NOTIFY_ID")]
        id: String,
    },

    /// Check that the master answers
    Ping {
        /// Words to echo
        words: Vec<String>,
    },

    /// Stop the master
    StopMaster,

    /// Replace the master's image, keeping its children
    RestartMaster,
}

fn main() -> anyhow::Result<ExitCode> {
    // Stdout may carry the handoff table; logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(ref socket) = cli.socket {
        config.socket = socket.clone();
    }

    let request = match cli.command {
        Commands::RunMaster {
            pid_file,
            inherit_listener,
            restore_handles,
            handoff_helper,
        } => {
            if pid_file.is_some() {
                config.pid_file = pid_file;
            }
            let master = MasterConfig {
                config,
                config_path: cli.config.clone(),
                inherit_listener,
                restore_handles,
                handoff_helper,
            };
            run_master(master)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Cmd { words } => words,
        Commands::Start(op) => op_request(Operation::Start, op, None),
        Commands::Stop { op, signal } => op_request(Operation::Stop, op, signal),
        Commands::Restart(op) => op_request(Operation::Restart, op, None),
        Commands::BgRestart(op) => op_request(Operation::BgRestart, op, None),
        Commands::Warmup(op) => op_request(Operation::Warmup, op, None),
        Commands::Status(op) => op_request(Operation::Status, op, None),
        Commands::Notify { id } => vec!["NOTIFY".to_string(), id],
        Commands::Ping { words } => {
            let mut request = vec!["PING".to_string()];
            request.extend(words);
            request
        }
        Commands::StopMaster => vec!["STOP-MASTER".to_string()],
        Commands::RestartMaster => vec!["RESTART-MASTER".to_string()],
    };

    let scheduler = Scheduler::new()?;
    let result = if cli.standalone {
        run_standalone(&scheduler, &config, &request)
    } else {
        let client = ControlClient::new(&config.socket);
        scheduler.block_on(client.call(&request, |report| {
            println!("< {}", compose_line(report));
        }))
    };

    match result {
        Ok(answer) => {
            println!("{}", compose_line(&answer));
            // NOTIFY answers FAIL when nothing waited for the standby.
            if answer.first().map(String::as_str) == Some("FAIL") {
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(shepherd::Error::Remote { code, message }) => {
            eprintln!("ERROR {} {}", code, message);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            eprintln!("ERROR {} {}", e.code(), e);
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Request words of a group operation.
fn op_request(operation: Operation, op: OpArgs, signal: Option<i32>) -> Vec<String> {
    let mut request = vec![operation.name().to_string()];
    request.extend(op.names);
    if op.wait {
        request.push("wait=1".to_string());
    }
    if op.verbose {
        request.push("verbose=1".to_string());
    }
    if let Some(signal) = signal {
        request.push(format!("signal={}", signal));
    }
    request
}

/// Run a request in this process, tracking children by PID file only.
fn run_standalone(scheduler: &Scheduler, config: &Config, words: &[String]) -> shepherd::Result<Vec<String>> {
    let request = Request::parse(words)?;
    let operation = match request.spec.kind {
        shepherd::remote::CommandKind::Op(operation) => operation,
        _ => {
            return Err(shepherd::Error::NotSupported {
                name: request.spec.name.to_string(),
                reason: "needs a running master".to_string(),
            })
        }
    };

    let group = ProcessGroup::from_config(config)?;
    let (reporter, mut reports) = Reporter::channel();
    let opts = OpOptions {
        wait: request.args.flag("wait"),
        verbose: request.args.flag("verbose"),
        signal: request.signal()?,
        notify_socket: None,
        reporter,
    };

    info!(operation = operation.name(), "Running standalone");
    let result = scheduler.block_on(group.run(operation, request.args.positional(), &opts));

    while let Ok(report) = reports.try_recv() {
        println!("< {}", compose_line(&report));
    }
    result?.into_answer()
}
