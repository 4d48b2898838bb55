//! Master self-restart.
//!
//! The running master replaces its own image while keeping its PID, its
//! listening socket and its children:
//!
//! 1. The live-handle table is serialized as `name=pid=pidfile` lines and a
//!    socket pair is created.
//! 2. The master forks. The parent keeps the PID: it points stdout at one
//!    end of the pair, clears close-on-exec on the listener and execs the
//!    same executable with `--restore-handles`.
//! 3. The forked helper writes the table into the other end, shuts down its
//!    write side and waits until the new image closed the channel. Then it
//!    answers `OK` on the requesting client's connection and exits.
//! 4. The new image reads stdout to EOF, parses the table, points stdout at
//!    `/dev/null` and re-attaches the listed children.

use crate::error::{Error, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{dup2, execv, fork, ForkResult};
use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use tracing::{error, info};

/// Descriptor the new image reads the handoff table from.
pub const TABLE_FD: RawFd = libc::STDOUT_FILENO;

/// Flag naming the forked helper the new image has to reap.
pub const HELPER_FLAG: &str = "--handoff-helper";

/// One live child handed to the next master image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRecord {
    pub name: String,
    pub pid: u32,
    pub pid_file: PathBuf,
}

impl HandoffRecord {
    fn to_line(&self) -> String {
        format!("{}={}={}\n", self.name, self.pid, self.pid_file.display())
    }

    fn parse(line: &str) -> Result<Self> {
        let corrupt = || Error::HandoffCorrupt(line.to_string());

        let mut parts = line.splitn(3, '=');
        let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(corrupt)?;
        let pid = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .filter(|p| *p > 0)
            .ok_or_else(corrupt)?;
        let pid_file = parts.next().filter(|p| !p.is_empty()).ok_or_else(corrupt)?;

        Ok(Self {
            name: name.to_string(),
            pid,
            pid_file: PathBuf::from(pid_file),
        })
    }
}

pub fn serialize_table(records: &[HandoffRecord]) -> String {
    records.iter().map(HandoffRecord::to_line).collect()
}

pub fn parse_table(text: &str) -> Result<Vec<HandoffRecord>> {
    text.lines()
        .filter(|line| !line.is_empty())
        .map(HandoffRecord::parse)
        .collect()
}

/// Read a table until the writer shuts down its side.
pub fn read_table(mut channel: impl Read) -> Result<Vec<HandoffRecord>> {
    let mut text = String::new();
    channel.read_to_string(&mut text)?;
    parse_table(&text)
}

/// Write the table, then wait for the reader to close the channel.
///
/// Runs in the forked helper, so it must not allocate.
fn send_table(channel: &mut UnixStream, payload: &[u8]) -> std::io::Result<()> {
    channel.write_all(payload)?;
    channel.shutdown(Shutdown::Write)?;

    let mut buf = [0u8; 64];
    while channel.read(&mut buf)? > 0 {}
    Ok(())
}

/// How to launch the next master image.
pub struct Relaunch {
    pub exe: PathBuf,
    /// Arguments after the program name
    pub args: Vec<OsString>,
}

impl Relaunch {
    /// Relaunch the running executable with `args`.
    pub fn current(args: Vec<OsString>) -> Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
            args,
        })
    }

    fn argv(&self, helper: i32) -> Result<Vec<CString>> {
        let invalid = |_| Error::RestartAborted("argument contains a NUL byte".to_string());

        let mut argv = vec![CString::new(self.exe.as_os_str().as_bytes()).map_err(invalid)?];
        for arg in &self.args {
            argv.push(CString::new(arg.as_bytes()).map_err(invalid)?);
        }
        argv.push(CString::new(HELPER_FLAG).map_err(invalid)?);
        argv.push(CString::new(helper.to_string()).map_err(invalid)?);
        Ok(argv)
    }
}

/// Replace the running master image, handing over `table`.
///
/// `listener` stays open across the exec; `client` is the connection that
/// requested the restart and receives the answer from the helper. Returns
/// only if the restart was aborted before the fork.
pub fn restart_master(
    relaunch: &Relaunch,
    table: &[HandoffRecord],
    listener: RawFd,
    client: RawFd,
) -> Result<Infallible> {
    let abort = |what: &str, e: &dyn std::fmt::Display| Error::RestartAborted(format!("{}: {}", what, e));

    let payload = serialize_table(table).into_bytes();
    let (reader, mut writer) = UnixStream::pair().map_err(|e| abort("socketpair", &e))?;
    let exe = CString::new(relaunch.exe.as_os_str().as_bytes())
        .map_err(|e| abort("executable path", &e))?;
    // Past the fork there is no way back; catch bad arguments here.
    relaunch.argv(0)?;

    info!(processes = table.len(), exe = %relaunch.exe.display(), "Restarting master");

    // Everything the helper does below is limited to plain system calls.
    match unsafe { fork() }.map_err(|e| abort("fork", &e))? {
        ForkResult::Child => {
            drop(reader);
            let answer: &[u8] = match send_table(&mut writer, &payload) {
                Ok(()) => b"OK\n",
                Err(_) => b"ERROR UNK handoff\\ failed\n",
            };

            let mut conn = unsafe { UnixStream::from_raw_fd(client) };
            let _ = conn.set_nonblocking(false);
            let _ = conn.write_all(answer);
            unsafe { libc::_exit(0) }
        }
        ForkResult::Parent { child } => {
            drop(writer);
            if let Err(e) = exec_new_image(&exe, relaunch, child.as_raw(), reader.as_raw_fd(), listener) {
                // The old image cannot continue past a failed exec.
                error!(error = %e, "Master image replacement failed");
            }
            std::process::exit(1)
        }
    }
}

fn exec_new_image(
    exe: &CString,
    relaunch: &Relaunch,
    helper: i32,
    table: RawFd,
    listener: RawFd,
) -> Result<Infallible> {
    let argv = relaunch.argv(helper)?;

    fcntl(listener, FcntlArg::F_SETFD(FdFlag::empty()))?;
    dup2(table, TABLE_FD)?;

    Ok(execv(exe, &argv)?)
}

/// In the new image: read the table handed over on [`TABLE_FD`] and point
/// that descriptor at `/dev/null`, which releases the helper.
pub fn read_inherited_table() -> Result<Vec<HandoffRecord>> {
    let table = {
        // Borrow the descriptor; dup2 below replaces it.
        let channel = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(TABLE_FD) });
        read_table(&*channel)?
    };

    let null = OpenOptions::new().write(true).open("/dev/null")?;
    dup2(null.as_raw_fd(), TABLE_FD)?;

    info!(processes = table.len(), "Restored handoff table");
    Ok(table)
}
