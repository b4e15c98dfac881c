//! A Worker process started by hand, the way a Frontend spawns it.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use appserver::worker::{Bootstrap, SpawnRequest, REPLY_LEN};
use appserver::ServerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

const USER: &str = "alice";
const PASSWORD: &str = "secret";

fn config(root: &Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.paths.sessions = root.join("sessions");
    config.paths.sockets = root.join("sockets");
    config.paths.events = root.join("events");
    for dir in [&config.paths.sessions, &config.paths.sockets, &config.paths.events] {
        std::fs::create_dir_all(dir).unwrap();
    }
    config.auth.users.insert(USER.into(), PASSWORD.into());
    config
}

/// Spawn `appserver worker`, feed it `request` and return it with its reply.
async fn start_worker(config: &ServerConfig, request: SpawnRequest) -> (Child, String) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_appserver"))
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let bootstrap = Bootstrap {
        config: config.clone(),
        request,
    };
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(&serde_json::to_vec(&bootstrap).unwrap()).await.unwrap();
    drop(stdin);

    let mut reply = [0u8; REPLY_LEN];
    let stdout = child.stdout.as_mut().unwrap();
    tokio::time::timeout(Duration::from_secs(10), stdout.read_exact(&mut reply))
        .await
        .expect("worker replied")
        .unwrap();
    (child, String::from_utf8(reply.to_vec()).unwrap().trim_end().to_string())
}

#[tokio::test]
async fn stdout_closes_after_the_reply() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let login = SpawnRequest::Login {
        user: USER.into(),
        pass: PASSWORD.into(),
        lang: "en".into(),
    };
    let (mut child, id) = start_worker(&config, login).await;
    assert!(id.bytes().all(|b| b.is_ascii_digit()), "session id, got {:?}", id);

    let mut rest = Vec::new();
    let stdout = child.stdout.as_mut().unwrap();
    let n = tokio::time::timeout(Duration::from_secs(5), stdout.read_to_end(&mut rest))
        .await
        .expect("spawn pipe reaches EOF")
        .unwrap();
    assert_eq!(n, 0);
    assert!(child.try_wait().unwrap().is_none(), "worker keeps serving");

    child.kill().await.unwrap();
}

#[tokio::test]
async fn second_worker_for_a_live_session_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let login = SpawnRequest::Login {
        user: USER.into(),
        pass: PASSWORD.into(),
        lang: "en".into(),
    };
    let (mut first, id) = start_worker(&config, login).await;

    let resume = SpawnRequest::Resume {
        session_id: id.clone(),
        user: USER.into(),
        pass: PASSWORD.into(),
    };
    let (mut second, reply) = start_worker(&config, resume).await;
    assert_eq!(reply, "FAIL");
    let status = tokio::time::timeout(Duration::from_secs(5), second.wait())
        .await
        .expect("refused worker exits")
        .unwrap();
    assert!(!status.success());

    let socket = config.paths.sockets.join(format!("{}.sock", id));
    assert!(tokio::net::UnixStream::connect(&socket).await.is_ok(), "first worker still bound");
    assert!(first.try_wait().unwrap().is_none());
    first.kill().await.unwrap();
}
