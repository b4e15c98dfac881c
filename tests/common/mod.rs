//! Shared utilities for integration tests.

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tempfile::TempDir;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";

/// A Frontend process running against a private temp directory.
pub struct TestServer {
    child: Child,
    pub addr: SocketAddr,
    pub config_path: PathBuf,
    pub dir: TempDir,
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

impl TestServer {
    /// Start a Frontend and wait until it accepts connections.
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
        let root = dir.path().display();
        let config = format!(
            r#"
[listener]
bind_address = "{addr}"

[paths]
sessions = "{root}/sessions"
sockets = "{root}/sockets"
events = "{root}/events"

[worker]
timeout_secs = 60
response_timeout_secs = 10

[http]
compression_threshold = 1048576

[auth.users]
{user} = "{password}"
"#,
            addr = addr,
            root = root,
            user = USER,
            password = PASSWORD,
        );
        let config_path = dir.path().join("appserver.toml");
        std::fs::write(&config_path, config).unwrap();

        let child = Command::new(env!("CARGO_BIN_EXE_appserver"))
            .arg("serve")
            .arg("--config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        let server = Self {
            child,
            addr,
            config_path,
            dir,
        };
        for _ in 0..200 {
            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                return server;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("appserver did not start on {}", addr);
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Run `appserver <subcommand> --config <ours> <args>`.
    pub fn cli(&self, subcommand: &str, args: &[&str]) -> std::process::Output {
        Command::new(env!("CARGO_BIN_EXE_appserver"))
            .arg(subcommand)
            .arg("--config")
            .arg(&self.config_path)
            .args(args)
            .output()
            .unwrap()
    }

    /// Stop the Frontend and every Worker it spawned.
    pub fn stop(mut self) {
        let _ = self.cli("ctl", &["--cluster-id", "1", "shutdown"]);
        let _ = self.child.wait();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Client that never follows redirects or pools connections across tests.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Value of the `sess` cookie set by `res`, if any.
pub fn session_cookie(res: &reqwest::Response) -> Option<String> {
    res.headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| v.strip_prefix("sess="))
        .map(|v| v.split(';').next().unwrap_or("").to_string())
}

/// Log in and return the new session ID.
pub async fn login(server: &TestServer, client: &reqwest::Client) -> String {
    let res = client
        .post(server.url("/login"))
        .form(&[("username", USER), ("password", PASSWORD)])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let id = session_cookie(&res).expect("login sets sess");
    assert!(!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()));
    id
}
