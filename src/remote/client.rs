//! Control socket client, used by the CLI and by standbys reporting
//! readiness.

use crate::error::{Error, Result};
use crate::remote::connection::{RemoteConnection, REPORT_MARKER};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Client for a running master.
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    /// Create a new control client
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Check if the control socket exists
    pub fn is_available(&self) -> bool {
        self.socket_path.exists()
    }

    /// Connect to the master
    pub async fn connect(&self) -> Result<RemoteConnection> {
        let conn = RemoteConnection::connect(&self.socket_path).await.map_err(|e| {
            Error::Protocol(format!(
                "Failed to connect to {}: {}. Is the master running?",
                self.socket_path.display(),
                e
            ))
        })?;

        debug!(path = %self.socket_path.display(), "Connected to control socket");
        Ok(conn)
    }

    /// Send a request and return the answer words. Report lines are passed
    /// to `on_report` (without their marker) as they arrive; an `ERROR`
    /// answer becomes [`Error::Remote`].
    pub async fn call<S, F>(&self, request: &[S], mut on_report: F) -> Result<Vec<String>>
    where
        S: AsRef<str>,
        F: FnMut(&[String]),
    {
        let mut conn = self.connect().await?;
        conn.send_words(request).await?;

        loop {
            let words = conn
                .read_words()
                .await?
                .ok_or_else(|| Error::Protocol("connection closed without an answer".to_string()))?;

            match words.first().map(String::as_str) {
                Some(REPORT_MARKER) => on_report(&words[1..]),
                Some("ERROR") => {
                    let code = words.get(1).map(String::as_str).unwrap_or("UNK");
                    let message = words.get(2).map(String::as_str).unwrap_or("");
                    return Err(Error::from_remote(code, message));
                }
                _ => return Ok(words),
            }
        }
    }

    /// Send a request, ignoring report lines.
    pub async fn request<S: AsRef<str>>(&self, request: &[S]) -> Result<Vec<String>> {
        self.call(request, |_| {}).await
    }

    pub async fn ping(&self) -> Result<bool> {
        match self.request(&["PING"]).await {
            Ok(answer) => Ok(answer.first().map(String::as_str) == Some("OK")),
            Err(_) => Ok(false),
        }
    }

    /// Report readiness of a warming standby. Returns once the standby was
    /// promoted (`true`) or refused (`false`).
    pub async fn notify(&self, instance_id: &str) -> Result<bool> {
        let answer = self.request(&["NOTIFY", instance_id]).await?;
        Ok(answer.first().map(String::as_str) == Some("OK"))
    }

    pub async fn stop_master(&self) -> Result<()> {
        self.request(&["STOP-MASTER"]).await?;
        Ok(())
    }
}
