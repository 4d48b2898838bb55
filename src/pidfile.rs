//! PID files: the durable record of which OS process runs a slot.
//!
//! A PID file holds one decimal PID followed by a newline. Anything else is
//! a hard error when read.

use crate::error::{Error, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cached {
    Unread,
    Absent,
    Pid(u32),
}

/// A PID file path with a cached view of its content.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    cached: Cached,
}

impl PidFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cached: Cached::Unread,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded PID, from cache once it is known.
    pub fn read(&mut self) -> Result<Option<u32>> {
        if self.cached == Cached::Unread {
            self.cached = match fs::read_to_string(&self.path) {
                Ok(content) => Cached::Pid(parse_pid(&self.path, &content)?),
                Err(e) if e.kind() == ErrorKind::NotFound => Cached::Absent,
                Err(e) => return Err(e.into()),
            };
        }

        Ok(match self.cached {
            Cached::Pid(pid) => Some(pid),
            _ => None,
        })
    }

    /// Forget the cached value so the next read goes to disk.
    pub fn invalidate(&mut self) {
        self.cached = Cached::Unread;
    }

    /// Record `pid`, replacing whatever was there.
    pub fn write(&mut self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(&self.path, format!("{}\n", pid))?;
        self.cached = Cached::Pid(pid);
        debug!(path = %self.path.display(), pid = pid, "Wrote PID file");
        Ok(())
    }

    /// Remove the file. Already absent is fine.
    pub fn clear(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed PID file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cached = Cached::Absent;
        Ok(())
    }

    /// Rename this file onto `other`. If this file has vanished, `other` is
    /// cleared instead of keeping stale content.
    pub fn move_to(&mut self, other: &mut PidFile) -> Result<()> {
        let moved = self.read()?;

        match fs::rename(&self.path, &other.path) {
            Ok(()) => {
                other.cached = match moved {
                    Some(pid) => Cached::Pid(pid),
                    None => Cached::Unread,
                };
            }
            Err(e) if e.kind() == ErrorKind::NotFound => other.clear()?,
            Err(e) => return Err(e.into()),
        }

        self.cached = Cached::Absent;
        Ok(())
    }
}

fn parse_pid(path: &Path, content: &str) -> Result<u32> {
    let corrupt = |reason: &str| Error::PidFileCorrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let digits = content
        .strip_suffix('\n')
        .ok_or_else(|| corrupt("missing trailing newline"))?;

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(corrupt("expected a decimal PID"));
    }

    match digits.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(corrupt("PID out of range")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_absent() {
        let dir = TempDir::new().unwrap();
        let mut pf = PidFile::new(dir.path().join("missing.pid"));
        assert_eq!(pf.read().unwrap(), None);
    }

    #[test]
    fn test_write_read_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/a.pid");
        let mut pf = PidFile::new(&path);

        pf.write(4242).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242\n");

        let mut fresh = PidFile::new(&path);
        assert_eq!(fresh.read().unwrap(), Some(4242));

        pf.clear().unwrap();
        assert!(!path.exists());
        assert_eq!(pf.read().unwrap(), None);
        // Clearing twice is harmless.
        pf.clear().unwrap();
    }

    #[test]
    fn test_corrupt_content() {
        let dir = TempDir::new().unwrap();
        for content in ["", "12", "12\n\n", "abc\n", " 12\n", "0\n"] {
            let path = dir.path().join("bad.pid");
            fs::write(&path, content).unwrap();
            let mut pf = PidFile::new(&path);
            assert!(
                matches!(pf.read(), Err(Error::PidFileCorrupt { .. })),
                "accepted {content:?}"
            );
        }
    }

    #[test]
    fn test_move_to() {
        let dir = TempDir::new().unwrap();
        let mut standby = PidFile::new(dir.path().join("s.pid"));
        let mut active = PidFile::new(dir.path().join("a.pid"));

        active.write(1).unwrap();
        standby.write(2).unwrap();
        standby.move_to(&mut active).unwrap();

        assert_eq!(active.read().unwrap(), Some(2));
        assert_eq!(standby.read().unwrap(), None);
        assert!(!standby.path().exists());
    }

    #[test]
    fn test_move_missing_source_clears_destination() {
        let dir = TempDir::new().unwrap();
        let mut standby = PidFile::new(dir.path().join("s.pid"));
        let mut active = PidFile::new(dir.path().join("a.pid"));

        active.write(7).unwrap();
        standby.move_to(&mut active).unwrap();

        assert_eq!(active.read().unwrap(), None);
        assert!(!active.path().exists());
    }
}
