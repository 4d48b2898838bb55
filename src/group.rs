//! Process groups and the operations that fan out across them.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handoff::HandoffRecord;
use crate::process::Process;
use crate::remote::wire::compose_line;
use crate::sched;
use nix::sys::signal::Signal;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Operations available on a group, and as remote commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Restart,
    BgRestart,
    Warmup,
    Status,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Start,
        Operation::Stop,
        Operation::Restart,
        Operation::BgRestart,
        Operation::Warmup,
        Operation::Status,
    ];

    /// Remote command name.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Start => "START",
            Operation::Stop => "STOP",
            Operation::Restart => "RESTART",
            Operation::BgRestart => "BG-RESTART",
            Operation::Warmup => "WARMUP",
            Operation::Status => "STATUS",
        }
    }

    /// Whether the operation changes process state.
    pub fn is_mutating(&self) -> bool {
        *self != Operation::Status
    }

    /// Whether an implicit "all members" selection includes placeholders.
    fn includes_placeholders(&self) -> bool {
        matches!(self, Operation::Stop | Operation::Status)
    }
}

/// Sink for report lines of one command.
#[derive(Clone, Default)]
pub struct Reporter {
    tx: Option<mpsc::UnboundedSender<Vec<String>>>,
}

impl Reporter {
    /// Create a reporter and the receiving end its lines arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    fn send(&self, words: Vec<String>) {
        if let Some(ref tx) = self.tx {
            // The connection may be gone; the operation carries on.
            let _ = tx.send(words);
        }
    }
}

/// Per-invocation options of an operation.
#[derive(Clone)]
pub struct OpOptions {
    /// Wait for the operation to complete (exit, readiness)
    pub wait: bool,
    /// Emit report lines
    pub verbose: bool,
    /// Signal used to terminate processes
    pub signal: Signal,
    /// Control socket standbys report readiness to; `None` without a master
    pub notify_socket: Option<PathBuf>,
    /// Where report lines go
    pub reporter: Reporter,
}

impl Default for OpOptions {
    fn default() -> Self {
        Self {
            wait: false,
            verbose: false,
            signal: Signal::SIGTERM,
            notify_socket: None,
            reporter: Reporter::default(),
        }
    }
}

impl OpOptions {
    /// Emit a report line `<process> <words...>` when verbose.
    pub fn report(&self, process: &str, words: &[&str]) {
        if self.verbose {
            let mut line = vec![process.to_string()];
            line.extend(words.iter().map(|w| w.to_string()));
            self.reporter.send(line);
        }
    }
}

/// Per-member outcome of a group operation, in target order.
pub struct GroupResult {
    entries: Vec<(String, Result<Vec<String>>)>,
}

impl GroupResult {
    pub fn entries(&self) -> &[(String, Result<Vec<String>>)] {
        &self.entries
    }

    /// Turn the outcome into answer words.
    ///
    /// A single target answers with its own words (or fails with its own
    /// error); several targets answer with `name result` pairs where each
    /// result is one composed word.
    pub fn into_answer(mut self) -> Result<Vec<String>> {
        let mut answer = vec!["OK".to_string()];

        if self.entries.len() == 1 {
            if let Some((_, result)) = self.entries.pop() {
                answer.extend(result?);
            }
            return Ok(answer);
        }

        for (name, result) in self.entries {
            let words = match result {
                Ok(words) => words,
                Err(e) => vec!["ERROR".to_string(), e.code().to_string()],
            };
            answer.push(name);
            answer.push(compose_line(&words));
        }
        Ok(answer)
    }
}

/// Ordered, name-unique collection of processes.
#[derive(Default)]
pub struct ProcessGroup {
    members: RefCell<Vec<Rc<Process>>>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a group from the configured process definitions.
    pub fn from_config(config: &Config) -> Result<Self> {
        let group = Self::new();
        for process in &config.processes {
            group.add(Rc::new(Process::new(process.clone())))?;
        }
        Ok(group)
    }

    /// Add a member. Names must be unique.
    pub fn add(&self, process: Rc<Process>) -> Result<()> {
        if self.get(process.name()).is_some() {
            return Err(Error::ConfigError(format!(
                "duplicate process name {:?}",
                process.name()
            )));
        }
        self.members.borrow_mut().push(process);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Rc<Process>> {
        self.members
            .borrow()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    pub fn members(&self) -> Vec<Rc<Process>> {
        self.members.borrow().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.members
            .borrow()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Resolve target names. No names selects every member the operation
    /// applies to; unknown names fail the whole call.
    pub fn resolve(&self, op: Operation, names: &[String]) -> Result<Vec<Rc<Process>>> {
        if names.is_empty() {
            return Ok(self
                .members
                .borrow()
                .iter()
                .filter(|p| op.includes_placeholders() || !p.is_placeholder())
                .cloned()
                .collect());
        }

        let mut targets: Vec<Rc<Process>> = Vec::new();
        let mut unknown = Vec::new();
        for name in names {
            match self.get(name) {
                Some(p) => {
                    if !targets.iter().any(|t| Rc::ptr_eq(t, &p)) {
                        targets.push(p);
                    }
                }
                None => {
                    if !unknown.contains(name) {
                        unknown.push(name.clone());
                    }
                }
            }
        }

        if !unknown.is_empty() {
            return Err(Error::NoSuchProcesses(unknown));
        }
        Ok(targets)
    }

    /// Run an operation on the named members concurrently.
    pub async fn run(&self, op: Operation, names: &[String], opts: &OpOptions) -> Result<GroupResult> {
        let targets = self.resolve(op, names)?;
        info!(operation = op.name(), targets = targets.len(), "Running operation");

        let results = sched::run_all(targets.iter().map(|p| p.run(op, opts))).await;
        let entries: Vec<_> = targets
            .iter()
            .map(|p| p.name().to_string())
            .zip(results)
            .collect();

        if op == Operation::Stop {
            self.prune(&entries);
        }

        Ok(GroupResult { entries })
    }

    /// Drop placeholders whose process is gone after a stop.
    fn prune(&self, entries: &[(String, Result<Vec<String>>)]) {
        let stopped: Vec<&str> = entries
            .iter()
            .filter(|(_, r)| matches!(r, Ok(_) | Err(Error::NotRunning(_))))
            .map(|(name, _)| name.as_str())
            .collect();

        self.members.borrow_mut().retain(|p| {
            let prune = p.is_placeholder() && stopped.contains(&p.name());
            if prune {
                info!(process = %p.name(), "Removed inherited placeholder");
            }
            !prune
        });
    }

    /// Member whose standby is waiting on `instance_id`.
    pub fn find_by_instance(&self, instance_id: &str) -> Option<Rc<Process>> {
        self.members
            .borrow()
            .iter()
            .find(|p| p.instance_id().as_deref() == Some(instance_id))
            .cloned()
    }

    /// Deliver a readiness notification. `false` if nothing waits for it.
    pub async fn notify(&self, instance_id: &str) -> bool {
        match self.find_by_instance(instance_id) {
            Some(process) => process.notify().await,
            None => false,
        }
    }

    /// Live-handle table handed to the next master image.
    pub fn live_table(&self) -> Vec<HandoffRecord> {
        self.members
            .borrow()
            .iter()
            .filter_map(|p| {
                p.live_pid().map(|pid| HandoffRecord {
                    name: p.name().to_string(),
                    pid,
                    pid_file: p.active_pid_path(),
                })
            })
            .collect()
    }

    /// Terminate every warm standby.
    pub async fn abandon_standbys(&self, sig: Signal) -> Result<()> {
        for process in self.members() {
            process.abandon_standby(sig).await?;
        }
        Ok(())
    }

    /// Re-attach processes inherited from the previous master image.
    /// Records without a matching member become placeholders.
    pub fn restore(&self, records: Vec<HandoffRecord>) {
        for record in records {
            match self.get(&record.name) {
                Some(process) => {
                    if process.active_pid_path() != record.pid_file {
                        warn!(
                            process = %record.name,
                            old = %record.pid_file.display(),
                            new = %process.active_pid_path().display(),
                            "PID file moved across restart"
                        );
                    }
                    process.adopt(record.pid);
                }
                None => {
                    let process = Rc::new(Process::placeholder(&record.name, &record.pid_file));
                    process.adopt(record.pid);
                    self.members.borrow_mut().push(process);
                }
            }
        }
    }
}
