//! The master: control socket, accept loop and command dispatch.
//!
//! All mutating commands run under one global lock, so two of them never
//! interleave. Each operation runs as its own task: a client that goes away
//! mid-command does not cancel it, the result is just never delivered.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::group::{GroupResult, OpOptions, Operation, ProcessGroup, Reporter};
use crate::handoff::{self, Relaunch};
use crate::pidfile::PidFile;
use crate::process::LiveHandle;
use crate::remote::command::{CommandKind, Request};
use crate::remote::RemoteConnection;
use crate::sched::{self, Lock, Scheduler, Trigger};
use nix::sys::signal::Signal;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Everything a master needs to start, and to relaunch itself.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Process definitions
    pub config: Config,
    /// File the definitions were loaded from
    pub config_path: Option<PathBuf>,
    /// Listening descriptor inherited from the previous image
    pub inherit_listener: Option<RawFd>,
    /// Read the handoff table from stdout before serving
    pub restore_handles: bool,
    /// Forked helper of the previous image, to be reaped
    pub handoff_helper: Option<u32>,
}

impl MasterConfig {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            config_path: None,
            inherit_listener: None,
            restore_handles: false,
            handoff_helper: None,
        }
    }

    /// Command line of the next image after a self-restart.
    fn relaunch_args(&self, listener: RawFd) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["run-master".into()];
        if let Some(ref path) = self.config_path {
            args.push("--config".into());
            args.push(path.into());
        }
        args.push("--socket".into());
        args.push(self.config.socket.clone().into());
        if let Some(ref path) = self.config.pid_file {
            args.push("--pid-file".into());
            args.push(path.into());
        }
        args.push("--inherit-listener".into());
        args.push(listener.to_string().into());
        args.push("--restore-handles".into());
        args
    }
}

/// Listening control socket.
pub struct ControlServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl ControlServer {
    /// Bind the socket. A socket file nobody answers on is replaced; one a
    /// live master listens on is an error.
    pub fn bind(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        match std::os::unix::net::UnixStream::connect(&socket_path) {
            Ok(_) => return Err(Error::SocketInUse(socket_path)),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                info!(path = %socket_path.display(), "Removing stale control socket");
                std::fs::remove_file(&socket_path)?;
            }
            // Could not tell whether a master is listening; leave the file alone.
            Err(e) => return Err(e.into()),
        }

        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)?;

        // Set socket permissions (allow user and group)
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o660);
            std::fs::set_permissions(&socket_path, permissions)?;
        }

        info!(path = %socket_path.display(), "Control socket listening");
        Self::from_std(socket_path, listener)
    }

    /// Take over a listening descriptor inherited across a self-restart.
    pub fn inherit(socket_path: impl AsRef<Path>, fd: RawFd) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };

        info!(path = %socket_path.display(), fd = fd, "Control socket inherited");
        Self::from_std(socket_path, listener)
    }

    fn from_std(socket_path: PathBuf, listener: std::os::unix::net::UnixListener) -> Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            socket_path,
            listener: UnixListener::from_std(listener)?,
        })
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        debug!("Accepted control connection");
        Ok(stream)
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        // Clean up socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "Failed to remove control socket");
            }
        }
    }
}

/// A running master.
pub struct Master {
    group: ProcessGroup,
    lock: Lock,
    shutdown: Trigger,
    server: ControlServer,
    config: MasterConfig,
}

impl Master {
    pub fn new(config: MasterConfig, server: ControlServer) -> Result<Self> {
        Ok(Self {
            group: ProcessGroup::from_config(&config.config)?,
            lock: Lock::new(()),
            shutdown: Trigger::new(),
            server,
            config,
        })
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn shutdown_trigger(&self) -> Trigger {
        self.shutdown.clone()
    }

    /// Accept and serve connections until shutdown.
    pub async fn serve(self: &Rc<Self>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.fired() => break,
                accepted = self.server.accept() => match accepted {
                    Ok(stream) => {
                        let master = Rc::clone(self);
                        connections.spawn_local(async move {
                            master.handle(RemoteConnection::new(stream)).await
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept control connection"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection handler panicked");
                    }
                }
            }
        }

        info!("Master shutting down");
        while connections.join_next().await.is_some() {}

        let _guard = self.lock.lock().await;
        if let Err(e) = self.group.abandon_standbys(Signal::SIGTERM).await {
            warn!(error = %e, "Failed to terminate standbys");
        }
    }

    /// Serve one client session.
    async fn handle(self: Rc<Self>, mut conn: RemoteConnection) {
        loop {
            let words = match self.shutdown.guard(conn.read_words()).await {
                None | Some(Ok(None)) => break,
                Some(Ok(Some(words))) => words,
                Some(Err(e)) if e.is_internal() => {
                    debug!(error = %e, "Control connection failed");
                    break;
                }
                Some(Err(e)) => {
                    if conn.send_error(&e).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let request = match Request::parse(&words) {
                Ok(request) => request,
                Err(e) => {
                    if conn.send_error(&e).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let result = match self.shutdown.guard(self.dispatch(&request, &mut conn)).await {
                Some(result) => result,
                None => break,
            };

            let sent = match result {
                Ok(answer) => conn.send_words(&answer).await,
                Err(e) if e.is_internal() => {
                    error!(command = request.spec.name, error = %e, "Command failed");
                    let _ = conn.send_error(&e).await;
                    break;
                }
                Err(e) => conn.send_error(&e).await,
            };
            if sent.is_err() {
                break;
            }

            if request.spec.kind == CommandKind::StopMaster {
                self.shutdown.fire();
                break;
            }
        }
    }

    async fn dispatch(self: &Rc<Self>, request: &Request, conn: &mut RemoteConnection) -> Result<Vec<String>> {
        let args = &request.args;

        match request.spec.kind {
            CommandKind::Ping => {
                let mut answer = vec!["OK".to_string()];
                answer.extend(args.positional().iter().cloned());
                Ok(answer)
            }
            CommandKind::Notify => {
                let id = args
                    .positional()
                    .first()
                    .ok_or_else(|| Error::Syntax("missing instance id".to_string()))?;
                let answer = if self.group.notify(id).await { "OK" } else { "FAIL" };
                Ok(vec![answer.to_string()])
            }
            CommandKind::StopMaster => {
                // Let a running mutation finish first.
                let _guard = self.lock.lock().await;
                info!("Stop requested");
                Ok(vec!["OK".to_string()])
            }
            CommandKind::RestartMaster => {
                let _guard = self.lock.lock().await;
                self.restart(conn).await
            }
            CommandKind::Op(op) => self.run_operation(op, request, conn).await,
        }
    }

    /// Run a group operation in its own task, forwarding its report lines.
    async fn run_operation(
        self: &Rc<Self>,
        op: Operation,
        request: &Request,
        conn: &mut RemoteConnection,
    ) -> Result<Vec<String>> {
        let (reporter, mut reports) = Reporter::channel();
        let opts = OpOptions {
            wait: request.args.flag("wait"),
            verbose: request.args.flag("verbose"),
            signal: request.signal()?,
            notify_socket: Some(self.server.socket_path().to_path_buf()),
            reporter,
        };
        let names = request.args.positional().to_vec();
        let exclusive = request.spec.exclusive;
        let master = Rc::clone(self);

        let mut task = tokio::task::spawn_local(async move {
            let _guard = if exclusive {
                Some(master.lock.lock().await)
            } else {
                None
            };
            master
                .group
                .run(op, &names, &opts)
                .await
                .and_then(GroupResult::into_answer)
        });

        loop {
            tokio::select! {
                biased;
                Some(line) = reports.recv() => {
                    // Undeliverable reports are dropped; the operation goes on.
                    let _ = conn.send_report(&line).await;
                }
                joined = &mut task => {
                    while let Ok(line) = reports.try_recv() {
                        let _ = conn.send_report(&line).await;
                    }
                    return joined.map_err(|e| {
                        Error::Io(std::io::Error::new(ErrorKind::Other, format!("operation task failed: {}", e)))
                    })?;
                }
            }
        }
    }

    /// Hand everything over to a fresh image of this executable. Only
    /// returns if the restart was aborted.
    async fn restart(&self, conn: &RemoteConnection) -> Result<Vec<String>> {
        self.group.abandon_standbys(Signal::SIGTERM).await?;

        let listener = self.server.as_raw_fd();
        let relaunch = Relaunch::current(self.config.relaunch_args(listener))
            .map_err(|e| Error::RestartAborted(e.to_string()))?;

        let never = handoff::restart_master(&relaunch, &self.group.live_table(), listener, conn.as_raw_fd())?;
        match never {}
    }
}

/// Fire `shutdown` on SIGTERM or SIGINT.
async fn listen_for_signals(shutdown: Trigger) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = shutdown.fired() => return Ok(()),
    }
    shutdown.fire();
    Ok(())
}

/// Run a master until it is told to stop.
pub fn run_master(config: MasterConfig) -> Result<()> {
    sched::set_error_handler(|e| error!(error = %e, "Routine failed"));

    let scheduler = Scheduler::new()?;
    scheduler.block_on(async move {
        let server = match config.inherit_listener {
            Some(fd) => ControlServer::inherit(&config.config.socket, fd)?,
            None => ControlServer::bind(&config.config.socket)?,
        };

        let restore = config.restore_handles;
        let helper = config.handoff_helper;
        let pid_file = config.config.pid_file.clone();
        let master = Rc::new(Master::new(config, server)?);

        if restore {
            master.group.restore(handoff::read_inherited_table()?);
        }
        if let Some(pid) = helper {
            sched::spawn(async move {
                LiveHandle::adopt(pid).wait().await?;
                Ok::<(), Error>(())
            });
        }

        let mut pid_file = pid_file.map(PidFile::new);
        if let Some(ref mut file) = pid_file {
            file.write(std::process::id())?;
        }

        sched::spawn(listen_for_signals(master.shutdown_trigger()));
        info!(pid = std::process::id(), processes = master.group.names().len(), "Master running");

        master.serve().await;

        if let Some(ref mut file) = pid_file {
            file.clear()?;
        }
        info!("Master stopped");
        Ok::<(), Error>(())
    })
}
