//! Supervised processes.
//!
//! A [`Process`] owns one slot: its active PID file, its standby PID file,
//! the live handle of the instance this supervisor runs (if any) and the
//! readiness latch used during warm restarts.

use crate::config::{ProcessConfig, Stream};
use crate::error::{Error, Result};
use crate::group::{OpOptions, Operation};
use crate::pidfile::PidFile;
use crate::sched::{self, Latch};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::cell::RefCell;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often exit of a process without a waitable handle is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Warm-restart readiness of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// No standby in flight
    Idle,
    /// Standby spawned, waiting for its notification
    Starting,
    /// Standby notified readiness
    Ready,
    /// Standby held ready for promotion
    Standby,
}

/// Result of probing a PID with the null signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Running,
    /// Exists but belongs to another user
    Privileged,
    NotFound,
}

/// Probe whether `pid` exists without affecting it.
pub fn probe(pid: u32) -> Result<Probe> {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Ok(Probe::Running),
        Err(Errno::EPERM) => Ok(Probe::Privileged),
        Err(Errno::ESRCH) => Ok(Probe::NotFound),
        Err(e) => Err(e.into()),
    }
}

/// Send `sig` to `pid`. Returns `false` if the process no longer exists.
pub fn signal_pid(pid: u32, sig: Signal) -> Result<bool> {
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {
            debug!(pid = pid, signal = ?sig, "Sent signal to process");
            Ok(true)
        }
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Wait for a process we cannot `wait()` on to disappear.
async fn wait_gone(pid: u32) -> Result<()> {
    loop {
        // Reap it in case it is our child after all.
        let _ = waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG));
        if probe(pid)? == Probe::NotFound {
            return Ok(());
        }
        sched::sleep(POLL_INTERVAL).await;
    }
}

/// Exit code of a status; killed-by-signal maps to the negated signal.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

enum HandleKind {
    /// Spawned by this supervisor instance
    Spawned(Child),
    /// Inherited across a self-restart; still our child, waited by PID
    Adopted,
}

/// In-memory handle on an OS process this supervisor is responsible for.
pub struct LiveHandle {
    pid: u32,
    kind: HandleKind,
    exited: bool,
    code: Option<i32>,
}

impl LiveHandle {
    fn spawned(child: Child) -> Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| Error::ProcessSpawnFailed("child exited before tracking".to_string()))?;

        Ok(Self {
            pid,
            kind: HandleKind::Spawned(child),
            exited: false,
            code: None,
        })
    }

    /// Track a process inherited from a previous supervisor image.
    pub fn adopt(pid: u32) -> Self {
        Self {
            pid,
            kind: HandleKind::Adopted,
            exited: false,
            code: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit code, once exit was observed. `None` also when unknown.
    pub fn exit_code(&self) -> Option<i32> {
        self.code
    }

    /// Check for exit without blocking; records the exit status.
    pub fn poll_exit(&mut self) -> Result<bool> {
        if self.exited {
            return Ok(true);
        }

        match &mut self.kind {
            HandleKind::Spawned(child) => {
                if let Some(status) = child.try_wait()? {
                    self.record(Some(exit_code(status)));
                }
            }
            HandleKind::Adopted => {
                match waitpid(Pid::from_raw(self.pid as i32), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(_, code)) => self.record(Some(code)),
                    Ok(WaitStatus::Signaled(_, sig, _)) => self.record(Some(-(sig as i32))),
                    Ok(_) => {}
                    // Someone else reaped it; only existence is left to check.
                    Err(Errno::ECHILD) => {
                        if probe(self.pid)? == Probe::NotFound {
                            self.record(None);
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(self.exited)
    }

    fn record(&mut self, code: Option<i32>) {
        self.exited = true;
        self.code = code;
        debug!(pid = self.pid, code = ?code, "Process exited");
    }

    /// Send a signal unless the process is already gone.
    pub fn signal(&mut self, sig: Signal) -> Result<()> {
        if !self.poll_exit()? {
            signal_pid(self.pid, sig)?;
        }
        Ok(())
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait(&mut self) -> Result<Option<i32>> {
        if self.exited {
            return Ok(self.code);
        }

        if let HandleKind::Spawned(child) = &mut self.kind {
            let status = child.wait().await?;
            self.record(Some(exit_code(status)));
            return Ok(self.code);
        }

        while !self.poll_exit()? {
            sched::sleep(POLL_INTERVAL).await;
        }
        Ok(self.code)
    }
}

/// Startup-notification details handed to a standby.
struct Notify<'a> {
    arg: String,
    id: &'a str,
    socket: &'a Path,
}

/// A supervised unit.
pub struct Process {
    config: ProcessConfig,
    /// Inherited across a self-restart with no matching definition
    placeholder: bool,
    active_file: RefCell<PidFile>,
    standby_file: RefCell<PidFile>,
    live: RefCell<Option<LiveHandle>>,
    standby: RefCell<Option<LiveHandle>>,
    latch: Latch<Readiness>,
    instance_id: RefCell<Option<String>>,
}

impl Process {
    /// Create a process from its (defaulted) definition.
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            active_file: RefCell::new(PidFile::new(&config.pid_file)),
            standby_file: RefCell::new(PidFile::new(&config.standby_pid_file)),
            config,
            placeholder: false,
            live: RefCell::new(None),
            standby: RefCell::new(None),
            latch: Latch::new(Readiness::Idle),
            instance_id: RefCell::new(None),
        }
    }

    /// Create a stand-in for an inherited process that has no definition.
    /// It can only be stopped or queried.
    pub fn placeholder(name: &str, pid_file: &Path) -> Self {
        let mut config = ProcessConfig::new(name, "");
        config.pid_file = pid_file.to_path_buf();

        let mut process = Self::new(config);
        process.placeholder = true;
        process
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    pub fn active_pid_path(&self) -> PathBuf {
        self.active_file.borrow().path().to_path_buf()
    }

    pub fn readiness(&self) -> Readiness {
        self.latch.get()
    }

    /// Instance id of the standby currently warming up.
    pub fn instance_id(&self) -> Option<String> {
        self.instance_id.borrow().clone()
    }

    /// PID of the live instance if it has not been seen exiting.
    pub fn live_pid(&self) -> Option<u32> {
        let mut live = self.live.borrow_mut();
        let handle = live.as_mut()?;
        match handle.poll_exit() {
            Ok(false) => Some(handle.pid()),
            _ => None,
        }
    }

    /// PID of the standby instance, if one exists.
    pub fn standby_pid(&self) -> Option<u32> {
        self.standby.borrow().as_ref().map(LiveHandle::pid)
    }

    /// Attach a process inherited across a self-restart.
    pub fn adopt(&self, pid: u32) {
        info!(process = %self.name(), pid = pid, "Adopted inherited process");
        *self.live.borrow_mut() = Some(LiveHandle::adopt(pid));
    }

    /// Whether the active slot is occupied by a running process.
    fn is_running(&self) -> Result<bool> {
        if let Some(handle) = self.live.borrow_mut().as_mut() {
            if !handle.poll_exit()? {
                return Ok(true);
            }
            self.forget_exited(handle.pid())?;
        }

        // Someone else may have started an instance since we last looked.
        let pid = {
            let mut active_file = self.active_file.borrow_mut();
            active_file.invalidate();
            active_file.read()?
        };
        match pid {
            Some(pid) => Ok(probe(pid)? != Probe::NotFound),
            None => Ok(false),
        }
    }

    /// Clear the active PID file once its recorded instance was seen
    /// exiting, so the reaped PID is never signalled.
    fn forget_exited(&self, pid: u32) -> Result<()> {
        let mut active_file = self.active_file.borrow_mut();
        active_file.invalidate();
        if active_file.read()? == Some(pid) {
            active_file.clear()?;
        }
        Ok(())
    }

    fn spawn(&self, notify: Option<Notify<'_>>) -> Result<LiveHandle> {
        let argv = self.config.command.argv();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::ProcessSpawnFailed(format!("{}: empty command", self.name())))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(&self.config.env);

        if let Some(notify) = notify {
            cmd.arg(notify.arg);
            cmd.env("SHEPHERD_SOCKET", notify.socket);
            cmd.env("SHEPHERD_NOTIFY_ID", notify.id);
        }

        if let Some(ref dir) = self.config.work_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(self.config.stdin.open(Stream::Stdin)?);
        cmd.stdout(self.config.stdout.open(Stream::Stdout)?);
        cmd.stderr(self.config.stderr.open(Stream::Stderr)?);

        // Create new session for the process
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::ProcessSpawnFailed(format!("{}: {}", argv.join(" "), e)))?;

        let handle = LiveHandle::spawned(child)?;
        info!(process = %self.name(), pid = handle.pid(), "Spawned process");
        Ok(handle)
    }

    /// Run one group operation against this process.
    pub async fn run(self: &Rc<Self>, op: Operation, opts: &OpOptions) -> Result<Vec<String>> {
        match op {
            Operation::Start => self.start(opts).await,
            Operation::Stop => self.stop(opts).await,
            Operation::Restart => self.restart(opts).await,
            Operation::BgRestart => self.bg_restart(opts).await,
            Operation::Warmup => self.warmup(opts).await,
            Operation::Status => self.status(),
        }
    }

    /// Start the process, promoting a warm standby if there is one.
    pub async fn start(&self, opts: &OpOptions) -> Result<Vec<String>> {
        if self.placeholder {
            return Err(self.unsupported("inherited process has no definition"));
        }

        if self.standby.borrow().is_some() {
            let state = self
                .latch
                .wait_until(|s| matches!(s, Readiness::Standby | Readiness::Idle))
                .await;
            if state == Readiness::Standby && self.standby.borrow().is_some() {
                return self.promote(opts).await;
            }
        }

        if self.is_running()? {
            return Err(Error::AlreadyRunning(self.name().to_string()));
        }

        opts.report(self.name(), &["starting"]);
        let handle = self.spawn(None)?;
        let pid = handle.pid();

        self.active_file.borrow_mut().write(pid)?;
        *self.live.borrow_mut() = Some(handle);

        info!(process = %self.name(), pid = pid, "Process started");
        opts.report(self.name(), &["started", &pid.to_string()]);
        Ok(vec![pid.to_string()])
    }

    /// Replace the active instance with the ready standby.
    async fn promote(&self, opts: &OpOptions) -> Result<Vec<String>> {
        let old = self.live.borrow_mut().take();
        match old {
            Some(mut old) => {
                if !old.poll_exit()? {
                    opts.report(self.name(), &["stopping", &old.pid().to_string()]);
                    old.signal(opts.signal)?;
                    old.wait().await?;
                }
            }
            None => {
                let pid = self.active_file.borrow_mut().read()?;
                if let Some(pid) = pid {
                    if signal_pid(pid, opts.signal)? {
                        wait_gone(pid).await?;
                    }
                }
            }
        }

        let standby = self
            .standby
            .borrow_mut()
            .take()
            .ok_or_else(|| Error::NotRunning(format!("{} standby", self.name())))?;
        let pid = standby.pid();

        {
            let mut standby_file = self.standby_file.borrow_mut();
            let mut active_file = self.active_file.borrow_mut();
            standby_file.move_to(&mut active_file)?;
        }
        *self.live.borrow_mut() = Some(standby);
        self.reset_readiness();

        info!(process = %self.name(), pid = pid, "Promoted standby");
        opts.report(self.name(), &["promoted", &pid.to_string()]);
        Ok(vec![pid.to_string()])
    }

    /// Stop the process and any standby it has.
    pub async fn stop(&self, opts: &OpOptions) -> Result<Vec<String>> {
        let had_standby = self.abandon_standby(opts.signal).await?;

        let live = self.live.borrow_mut().take();
        if let Some(mut handle) = live {
            if handle.poll_exit()? {
                self.forget_exited(handle.pid())?;
                let code = handle.exit_code().map(|c| c.to_string());
                opts.report(self.name(), &["stopped", code.as_deref().unwrap_or("?")]);

                let mut words = vec!["OK".to_string()];
                words.extend(code);
                return Ok(words);
            }

            let pid = handle.pid();
            opts.report(self.name(), &["stopping", &pid.to_string()]);
            info!(process = %self.name(), pid = pid, "Stopping process");
            handle.signal(opts.signal)?;

            if opts.wait {
                let code = handle.wait().await?;
                self.active_file.borrow_mut().clear()?;
                let code = code.map(|c| c.to_string());
                opts.report(self.name(), &["stopped", code.as_deref().unwrap_or("?")]);

                let mut words = vec!["OK".to_string()];
                words.extend(code);
                return Ok(words);
            }

            self.active_file.borrow_mut().clear()?;
            sched::spawn(async move {
                handle.wait().await?;
                Ok::<(), Error>(())
            });
            sched::sleep(self.config.stop_delay).await;
            return Ok(vec!["OK".to_string()]);
        }

        let pid = {
            let mut active_file = self.active_file.borrow_mut();
            active_file.invalidate();
            active_file.read()?
        };

        match pid {
            Some(pid) => {
                opts.report(self.name(), &["stopping", &pid.to_string()]);
                let delivered = signal_pid(pid, opts.signal)?;
                if !delivered {
                    warn!(process = %self.name(), pid = pid, "Stale PID file");
                }
                self.active_file.borrow_mut().clear()?;

                if delivered {
                    if opts.wait {
                        wait_gone(pid).await?;
                    } else {
                        sched::sleep(self.config.stop_delay).await;
                    }
                }
                opts.report(self.name(), &["stopped"]);
                Ok(vec!["OK".to_string()])
            }
            None if had_standby => Ok(vec!["OK".to_string()]),
            None => Err(Error::NotRunning(self.name().to_string())),
        }
    }

    /// Stop (if running) and start again.
    pub async fn restart(&self, opts: &OpOptions) -> Result<Vec<String>> {
        let stop_opts = OpOptions {
            wait: true,
            ..opts.clone()
        };

        match self.stop(&stop_opts).await {
            Ok(_) | Err(Error::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.start(opts).await
    }

    /// Warm up a standby and promote it; a plain restart without a notify
    /// mechanism.
    pub async fn bg_restart(self: &Rc<Self>, opts: &OpOptions) -> Result<Vec<String>> {
        if self.config.notify_arg.is_none() || opts.notify_socket.is_none() {
            return self.restart(opts).await;
        }

        let warm_opts = OpOptions {
            wait: true,
            ..opts.clone()
        };
        self.warmup(&warm_opts).await?;
        self.start(opts).await
    }

    /// Spawn a standby instance that reports readiness over the control
    /// socket.
    pub async fn warmup(self: &Rc<Self>, opts: &OpOptions) -> Result<Vec<String>> {
        if self.placeholder {
            return Err(self.unsupported("inherited process has no definition"));
        }
        let template = self
            .config
            .notify_arg
            .as_deref()
            .ok_or_else(|| self.unsupported("no startup notification configured"))?;
        let socket = opts
            .notify_socket
            .as_deref()
            .ok_or_else(|| self.unsupported("no master to notify"))?;

        if self.standby.borrow().is_some() || self.latch.get() != Readiness::Idle {
            return Err(Error::AlreadyRunning(format!("{} standby", self.name())));
        }

        let id = Uuid::new_v4().simple().to_string();
        let arg = template
            .replace("{id}", &id)
            .replace("{socket}", &socket.display().to_string());

        self.latch.set(Readiness::Starting);
        *self.instance_id.borrow_mut() = Some(id.clone());

        opts.report(self.name(), &["warming"]);
        let handle = match self.spawn(Some(Notify {
            arg,
            id: &id,
            socket,
        })) {
            Ok(handle) => handle,
            Err(e) => {
                self.reset_readiness();
                return Err(e);
            }
        };
        let pid = handle.pid();
        *self.standby.borrow_mut() = Some(handle);
        self.standby_file.borrow_mut().write(pid)?;
        info!(process = %self.name(), pid = pid, instance = %id, "Warming up standby");

        let readiness = Rc::clone(self).await_readiness(opts.clone());
        if opts.wait {
            readiness.await?;
        } else {
            sched::spawn(async move {
                readiness.await?;
                Ok::<(), Error>(())
            });
        }

        Ok(vec![pid.to_string()])
    }

    /// Wait for the standby to notify, or fail if it exits first.
    async fn await_readiness(self: Rc<Self>, opts: OpOptions) -> Result<u32> {
        loop {
            tokio::select! {
                state = self.latch.wait_until(|s| matches!(s, Readiness::Ready | Readiness::Idle)) => {
                    if state == Readiness::Idle {
                        return Err(Error::NotRunning(format!("{} standby", self.name())));
                    }
                    break;
                }
                _ = sched::sleep(POLL_INTERVAL) => {
                    let exited = {
                        let mut standby = self.standby.borrow_mut();
                        match standby.as_mut() {
                            Some(handle) => {
                                if handle.poll_exit()? {
                                    Some(handle.exit_code())
                                } else {
                                    None
                                }
                            }
                            None => return Err(Error::NotRunning(format!("{} standby", self.name()))),
                        }
                    };

                    if let Some(code) = exited {
                        warn!(process = %self.name(), code = ?code, "Standby exited before becoming ready");
                        self.standby.borrow_mut().take();
                        self.standby_file.borrow_mut().clear()?;
                        self.reset_readiness();
                        return Err(Error::StandbyFailed {
                            name: self.name().to_string(),
                            code,
                        });
                    }
                }
            }
        }

        let pid = self
            .standby_pid()
            .ok_or_else(|| Error::NotRunning(format!("{} standby", self.name())))?;
        if !self.latch.transition(Readiness::Ready, Readiness::Standby) {
            return Err(Error::NotRunning(format!("{} standby", self.name())));
        }

        info!(process = %self.name(), pid = pid, "Standby ready");
        opts.report(self.name(), &["ready", &pid.to_string()]);
        Ok(pid)
    }

    /// Handle a readiness notification from the standby. Returns `false` if
    /// no standby is waiting for it; otherwise waits for promotion (or
    /// abandonment) before returning `true`.
    pub async fn notify(&self) -> bool {
        if !self.latch.transition(Readiness::Starting, Readiness::Ready) {
            return false;
        }
        debug!(process = %self.name(), "Standby notified readiness");
        self.latch.wait_for(Readiness::Idle).await;
        true
    }

    /// Terminate the standby, if any. Returns whether one existed.
    pub async fn abandon_standby(&self, sig: Signal) -> Result<bool> {
        let standby = self.standby.borrow_mut().take();
        let Some(mut handle) = standby else {
            return Ok(false);
        };

        info!(process = %self.name(), pid = handle.pid(), "Abandoning standby");
        if !handle.poll_exit()? {
            handle.signal(sig)?;
            handle.wait().await?;
        }
        self.standby_file.borrow_mut().clear()?;
        self.reset_readiness();
        Ok(true)
    }

    fn reset_readiness(&self) {
        self.latch.set(Readiness::Idle);
        *self.instance_id.borrow_mut() = None;
    }

    /// Report the state of the process.
    pub fn status(&self) -> Result<Vec<String>> {
        let mut words = match self.live_status()? {
            Some(words) => words,
            None => {
                let pid = {
                    let mut active_file = self.active_file.borrow_mut();
                    active_file.invalidate();
                    active_file.read()?
                };
                match pid {
                    None => vec!["NOT_RUNNING".to_string()],
                    Some(pid) => {
                        let state = match probe(pid)? {
                            Probe::Running => "RUNNING",
                            Probe::Privileged => "RUNNING_PRIVILEGED",
                            Probe::NotFound => "NOT_FOUND",
                        };
                        vec![state.to_string(), pid.to_string()]
                    }
                }
            }
        };

        if let Some(pid) = self.standby_pid() {
            words.push("STANDBY".to_string());
            words.push(pid.to_string());
        }
        Ok(words)
    }

    fn live_status(&self) -> Result<Option<Vec<String>>> {
        let mut live = self.live.borrow_mut();
        let Some(handle) = live.as_mut() else {
            return Ok(None);
        };

        let words = if handle.poll_exit()? {
            self.forget_exited(handle.pid())?;
            let mut words = vec!["EXITED".to_string()];
            words.extend(handle.exit_code().map(|c| c.to_string()));
            words
        } else {
            vec!["RUNNING".to_string(), handle.pid().to_string()]
        };
        Ok(Some(words))
    }

    fn unsupported(&self, reason: &str) -> Error {
        Error::NotSupported {
            name: self.name().to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;
    use tempfile::TempDir;

    fn make(dir: &TempDir, name: &str, command: &str) -> Rc<Process> {
        let config = ProcessConfig::new(name, command).with_defaults(dir.path());
        Rc::new(Process::new(config))
    }

    fn wait_opts() -> OpOptions {
        OpOptions {
            wait: true,
            ..OpOptions::default()
        }
    }

    #[test]
    fn test_exit_code_of_signal() {
        let status = std::process::ExitStatus::from_raw(libc::SIGTERM);
        assert_eq!(exit_code(status), -15);
        let status = std::process::ExitStatus::from_raw(3 << 8);
        assert_eq!(exit_code(status), 3);
    }

    #[test]
    fn test_start_status_stop() {
        let dir = TempDir::new().unwrap();
        let s = Scheduler::new().unwrap();
        let p = make(&dir, "sleeper", "sleep 100");

        s.block_on(async {
            assert_eq!(p.status().unwrap(), vec!["NOT_RUNNING"]);

            let started = p.start(&wait_opts()).await.unwrap();
            let pid = started[0].clone();
            assert_eq!(p.status().unwrap(), vec!["RUNNING".to_string(), pid.clone()]);
            assert_eq!(
                std::fs::read_to_string(&p.config().pid_file).unwrap(),
                format!("{}\n", pid)
            );

            assert!(matches!(
                p.start(&wait_opts()).await,
                Err(Error::AlreadyRunning(_))
            ));

            let stopped = p.stop(&wait_opts()).await.unwrap();
            assert_eq!(stopped, vec!["OK", "-15"]);
            assert!(!p.config().pid_file.exists());
            assert_eq!(p.status().unwrap(), vec!["NOT_RUNNING"]);

            assert!(matches!(p.stop(&wait_opts()).await, Err(Error::NotRunning(_))));
        });
    }

    #[test]
    fn test_stop_with_stale_pid_file() {
        let dir = TempDir::new().unwrap();
        let s = Scheduler::new().unwrap();
        let p = make(&dir, "stale", "sleep 100");

        // A reaped child's PID is a safe stand-in for a vanished process.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        std::fs::write(&p.config().pid_file, format!("{}\n", pid)).unwrap();

        s.block_on(async {
            assert_eq!(
                p.status().unwrap(),
                vec!["NOT_FOUND".to_string(), pid.to_string()]
            );
            assert_eq!(p.stop(&wait_opts()).await.unwrap(), vec!["OK"]);
        });
        assert!(!p.config().pid_file.exists());
    }

    #[test]
    fn test_stop_by_pid_file_only() {
        let dir = TempDir::new().unwrap();
        let s = Scheduler::new().unwrap();
        let p = make(&dir, "foreign", "sleep 100");

        let child = std::process::Command::new("sleep").arg("100").spawn().unwrap();
        let pid = child.id();
        std::fs::write(&p.config().pid_file, format!("{}\n", pid)).unwrap();

        s.block_on(async {
            assert_eq!(p.status().unwrap()[0], "RUNNING");
            assert_eq!(p.stop(&wait_opts()).await.unwrap(), vec!["OK"]);
        });
        assert_eq!(probe(pid).unwrap(), Probe::NotFound);
        drop(child);
    }

    #[test]
    fn test_start_refuses_instance_recorded_elsewhere() {
        let dir = TempDir::new().unwrap();
        let s = Scheduler::new().unwrap();
        let p = make(&dir, "shared", "sleep 100");
        let mut other = std::process::Command::new("sleep").arg("100").spawn().unwrap();

        s.block_on(async {
            assert_eq!(p.status().unwrap(), vec!["NOT_RUNNING"]);
            // Another supervisor records its instance after our last look.
            std::fs::write(&p.config().pid_file, format!("{}\n", other.id())).unwrap();

            assert!(matches!(
                p.start(&wait_opts()).await,
                Err(Error::AlreadyRunning(_))
            ));
        });
        assert_eq!(
            std::fs::read_to_string(&p.config().pid_file).unwrap(),
            format!("{}\n", other.id())
        );

        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[test]
    fn test_stop_after_exit_sends_no_signal() {
        let dir = TempDir::new().unwrap();
        let s = Scheduler::new().unwrap();

        let mut config = ProcessConfig::new("quick", "").with_defaults(dir.path());
        config.command = crate::config::CommandLine::Argv(vec![
            "sh".into(),
            "-c".into(),
            "exit 3".into(),
        ]);
        let p = Rc::new(Process::new(config));
        let (reporter, mut reports) = crate::group::Reporter::channel();
        let opts = OpOptions {
            wait: true,
            verbose: true,
            reporter,
            ..OpOptions::default()
        };

        s.block_on(async {
            p.start(&OpOptions::default()).await.unwrap();
            for _ in 0..100 {
                if p.status().unwrap()[0] == "EXITED" {
                    break;
                }
                sched::sleep(Duration::from_millis(20)).await;
            }
            assert_eq!(p.status().unwrap(), vec!["EXITED", "3"]);
            assert!(!p.config().pid_file.exists());

            assert_eq!(p.stop(&opts).await.unwrap(), vec!["OK", "3"]);
        });

        assert_eq!(reports.try_recv().unwrap(), vec!["quick", "stopped", "3"]);
        assert!(reports.try_recv().is_err());
    }

    #[test]
    fn test_warmup_without_notify_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let s = Scheduler::new().unwrap();
        let p = make(&dir, "plain", "sleep 100");

        let result = s.block_on(p.warmup(&OpOptions {
            notify_socket: Some(dir.path().join("sock")),
            ..OpOptions::default()
        }));
        assert!(matches!(result, Err(Error::NotSupported { .. })));
    }

    #[test]
    fn test_warmup_notify_and_promote() {
        let dir = TempDir::new().unwrap();
        let s = Scheduler::new().unwrap();

        let mut config = ProcessConfig::new("warm", "").with_defaults(dir.path());
        config.command = crate::config::CommandLine::Argv(vec![
            "sh".into(),
            "-c".into(),
            "sleep 100".into(),
            "sh".into(),
        ]);
        config.notify_arg = Some("--notify={id}".into());
        let p = Rc::new(Process::new(config));

        let opts = OpOptions {
            notify_socket: Some(dir.path().join("sock")),
            ..OpOptions::default()
        };

        s.block_on(async {
            let old = p.start(&opts).await.unwrap()[0].clone();

            let standby = p.warmup(&opts).await.unwrap()[0].clone();
            assert_eq!(p.readiness(), Readiness::Starting);
            assert!(p.instance_id().is_some());
            assert!(p.config().standby_pid_file.exists());
            assert!(matches!(p.warmup(&opts).await, Err(Error::AlreadyRunning(_))));

            let notifier = {
                let p = Rc::clone(&p);
                tokio::task::spawn_local(async move { p.notify().await })
            };
            // A second notification for the same standby is refused.
            sched::sleep(Duration::from_millis(10)).await;
            assert!(!p.notify().await);

            let promoted = p.start(&opts).await.unwrap()[0].clone();
            assert_eq!(promoted, standby);
            assert_ne!(promoted, old);
            assert!(notifier.await.unwrap());
            assert_eq!(p.readiness(), Readiness::Idle);
            assert!(p.instance_id().is_none());

            let status = p.status().unwrap();
            assert_eq!(status, vec!["RUNNING".to_string(), standby.clone()]);
            assert!(!p.config().standby_pid_file.exists());

            p.stop(&wait_opts()).await.unwrap();
        });
    }

    #[test]
    fn test_standby_exit_fails_warmup() {
        let dir = TempDir::new().unwrap();
        let s = Scheduler::new().unwrap();

        let mut config = ProcessConfig::new("flaky", "").with_defaults(dir.path());
        config.command = crate::config::CommandLine::Argv(vec![
            "sh".into(),
            "-c".into(),
            "exit 3".into(),
            "sh".into(),
        ]);
        config.notify_arg = Some("{id}".into());
        let p = Rc::new(Process::new(config));

        let result = s.block_on(p.warmup(&OpOptions {
            wait: true,
            notify_socket: Some(dir.path().join("sock")),
            ..OpOptions::default()
        }));
        assert!(matches!(
            result,
            Err(Error::StandbyFailed { code: Some(3), .. })
        ));
        assert_eq!(p.readiness(), Readiness::Idle);
        assert!(p.standby_pid().is_none());
    }

    #[test]
    fn test_adopted_child_is_waited() {
        let dir = TempDir::new().unwrap();
        let s = Scheduler::new().unwrap();
        let p = make(&dir, "inherited", "sleep 100");

        let child = std::process::Command::new("sleep").arg("100").spawn().unwrap();
        let pid = child.id();
        // The handle below takes over reaping.
        drop(child);
        p.adopt(pid);

        s.block_on(async {
            assert_eq!(p.status().unwrap(), vec!["RUNNING".to_string(), pid.to_string()]);
            assert_eq!(p.stop(&wait_opts()).await.unwrap(), vec!["OK", "-15"]);
        });
    }
}
