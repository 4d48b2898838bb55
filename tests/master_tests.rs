//! End-to-end tests: a master on its own thread, driven over its socket.

use shepherd::config::CommandLine;
use shepherd::remote::wire::parse_line;
use shepherd::{run_master, Config, ControlClient, Error, MasterConfig, ProcessConfig};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::TempDir;

struct TestMaster {
    dir: TempDir,
    socket: PathBuf,
    thread: Option<JoinHandle<shepherd::Result<()>>>,
}

impl TestMaster {
    async fn start(processes: Vec<ProcessConfig>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.socket = dir.path().join("control.sock");
        config.pid_file = Some(dir.path().join("master.pid"));
        config.run_dir = dir.path().to_path_buf();
        config.processes = processes
            .into_iter()
            .map(|p| p.with_defaults(dir.path()))
            .collect();

        let socket = config.socket.clone();
        let thread = std::thread::spawn(move || run_master(MasterConfig::new(config)));

        let client = ControlClient::new(&socket);
        for _ in 0..100 {
            if client.ping().await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Self {
            dir,
            socket,
            thread: Some(thread),
        }
    }

    fn client(&self) -> ControlClient {
        ControlClient::new(&self.socket)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    async fn stop(mut self) {
        self.client().stop_master().await.unwrap();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap().unwrap();
        }
        assert!(!self.socket.exists());
        assert!(!self.path("master.pid").exists());
    }
}

fn sleeper(name: &str) -> ProcessConfig {
    ProcessConfig::new(name, "sleep 100")
}

/// A process that writes the instance id it is started with to `id_file`.
fn notifying(name: &str, id_file: &Path) -> ProcessConfig {
    let mut config = ProcessConfig::new(name, "");
    config.command = CommandLine::Argv(vec![
        "sh".into(),
        "-c".into(),
        format!("[ \"$0\" = sh ] || echo \"$0\" > {}; exec sleep 100", id_file.display()),
    ]);
    config.notify_arg = Some("{id}".into());
    config
}

async fn read_id(path: &Path) -> String {
    for _ in 0..200 {
        if let Ok(id) = std::fs::read_to_string(path) {
            if id.ends_with('\n') {
                return id.trim().to_string();
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("standby never started");
}

fn code(result: shepherd::Result<Vec<String>>) -> String {
    match result {
        Err(Error::Remote { code, .. }) => code,
        other => panic!("expected an error answer, got {:?}", other),
    }
}

#[tokio::test]
async fn test_start_status_stop() {
    let master = TestMaster::start(vec![sleeper("echo")]).await;
    let client = master.client();

    let started = client.request(&["START", "name=echo"]).await.unwrap();
    assert_eq!(started[0], "OK");
    let pid = started[1].clone();
    assert_eq!(
        std::fs::read_to_string(master.path("echo.pid")).unwrap(),
        format!("{}\n", pid)
    );

    let status = client.request(&["STATUS", "name=echo"]).await.unwrap();
    assert_eq!(status, vec!["OK".to_string(), "RUNNING".to_string(), pid]);

    let stopped = client.request(&["STOP", "name=echo", "wait=true"]).await.unwrap();
    assert_eq!(stopped, vec!["OK", "OK", "-15"]);

    let status = client.request(&["STATUS", "name=echo"]).await.unwrap();
    assert_eq!(status, vec!["OK", "NOT_RUNNING"]);

    master.stop().await;
}

#[tokio::test]
async fn test_protocol_errors() {
    let master = TestMaster::start(vec![sleeper("echo")]).await;
    let client = master.client();

    assert_eq!(code(client.request(&["FROB"]).await), "NXCMD");
    assert_eq!(code(client.request(&["STOP", "nosuch", "other"]).await), "NXPROCS");
    assert_eq!(code(client.request(&["STOP", "echo", "signal=abc"]).await), "SYNTAX");
    assert_eq!(code(client.request(&["NOTIFY"]).await), "TFARGS");
    assert_eq!(code(client.request(&["STOP-MASTER", "now"]).await), "TMARGS");
    assert_eq!(code(client.request(&["STOP", "echo"]).await), "NOT_RUNNING");
    assert_eq!(code(client.request(&["WARMUP", "echo"]).await), "NOT_SUPPORTED");

    assert!(!client.notify("unknown").await.unwrap());
    let echoed = client.request(&["ping", "a b", ""]).await.unwrap();
    assert_eq!(echoed, vec!["OK", "a b", ""]);

    master.stop().await;
}

#[tokio::test]
async fn test_multi_target_answer_and_reports() {
    let master = TestMaster::start(vec![sleeper("a"), sleeper("b")]).await;
    let client = master.client();

    let mut reports = Vec::new();
    let started = client
        .call(&["START", "verbose=1"], |r| reports.push(r.to_vec()))
        .await
        .unwrap();
    assert_eq!(started.len(), 5);
    assert_eq!((started[1].as_str(), started[3].as_str()), ("a", "b"));
    assert_eq!(reports.len(), 4);
    assert!(reports.iter().any(|r| r[..2] == ["a", "starting"]));
    assert!(reports.iter().any(|r| r[..2] == ["b", "started"]));

    let status = client.request(&["STATUS", "b", "a"]).await.unwrap();
    assert_eq!(status[1], "b");
    assert_eq!(parse_line(&status[2]).unwrap(), vec!["RUNNING", started[4].as_str()]);
    assert_eq!(status[3], "a");

    let stopped = client.request(&["STOP", "wait=1"]).await.unwrap();
    assert_eq!(stopped, vec!["OK", "a", "OK -15", "b", "OK -15"]);

    let again = client.request(&["STOP", "a", "b"]).await.unwrap();
    assert_eq!(again, vec!["OK", "a", "ERROR NOT_RUNNING", "b", "ERROR NOT_RUNNING"]);

    master.stop().await;
}

#[tokio::test]
async fn test_concurrent_start_stop_serialized() {
    let master = TestMaster::start(vec![sleeper("echo")]).await;
    let client = master.client();
    let other = master.client();

    let (start, stop) = tokio::join!(
        client.request(&["START", "echo"]),
        other.request(&["STOP", "echo", "wait=1"]),
    );
    let status = client.request(&["STATUS", "echo"]).await.unwrap();
    let start = start.unwrap();

    match stop {
        // start, then stop
        Ok(stopped) => {
            assert_eq!(stopped, vec!["OK", "OK", "-15"]);
            assert_eq!(status, vec!["OK", "NOT_RUNNING"]);
        }
        // stop, then start
        Err(Error::Remote { code, .. }) => {
            assert_eq!(code, "NOT_RUNNING");
            assert_eq!(status, vec!["OK".to_string(), "RUNNING".to_string(), start[1].clone()]);
            client.request(&["STOP", "echo", "wait=1"]).await.unwrap();
        }
        Err(e) => panic!("unexpected failure: {}", e),
    }

    master.stop().await;
}

#[tokio::test]
async fn test_warmup_and_promote() {
    let dir = TempDir::new().unwrap();
    let id_file = dir.path().join("id");
    let master = TestMaster::start(vec![notifying("web", &id_file)]).await;
    let client = master.client();

    let old = client.request(&["START", "web"]).await.unwrap()[1].clone();
    let standby = client.request(&["WARMUP", "web"]).await.unwrap()[1].clone();

    let status = client.request(&["STATUS", "web"]).await.unwrap();
    assert_eq!(status, vec!["OK", "RUNNING", old.as_str(), "STANDBY", standby.as_str()]);

    // Play the standby: report readiness with the id it was handed.
    let id = read_id(&id_file).await;
    let notifier = {
        let socket = master.socket.clone();
        tokio::spawn(async move { ControlClient::new(socket).notify(&id).await })
    };

    let promoted = client.request(&["START", "web"]).await.unwrap();
    assert_eq!(promoted, vec!["OK".to_string(), standby.clone()]);
    assert!(notifier.await.unwrap().unwrap());

    let status = client.request(&["STATUS", "web"]).await.unwrap();
    assert_eq!(status, vec!["OK".to_string(), "RUNNING".to_string(), standby]);
    assert!(!master.path("web.standby.pid").exists());

    client.request(&["STOP", "web", "wait=1"]).await.unwrap();
    master.stop().await;
}

#[tokio::test]
async fn test_bg_restart() {
    let dir = TempDir::new().unwrap();
    let id_file = dir.path().join("id");
    let master = TestMaster::start(vec![notifying("web", &id_file)]).await;
    let client = master.client();

    let old = client.request(&["START", "web"]).await.unwrap()[1].clone();

    let restart = {
        let socket = master.socket.clone();
        tokio::spawn(async move { ControlClient::new(socket).request(&["BG-RESTART", "web"]).await })
    };

    let id = read_id(&id_file).await;
    assert!(client.notify(&id).await.unwrap());

    let restarted = restart.await.unwrap().unwrap();
    assert_eq!(restarted[0], "OK");
    assert_ne!(restarted[1], old);

    client.request(&["STOP", "web", "wait=1"]).await.unwrap();
    master.stop().await;
}
