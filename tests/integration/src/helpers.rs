//! Test helpers for spawning a kinetic-server and talking to it.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use kinetic_core::Response;
use kinetic_protocol::{decode_response, parse_frame, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A kinetic-server subprocess managed by the test harness.
pub struct TestServer {
    child: Child,
    pub port: u16,
    _config: Option<tempfile::NamedTempFile>,
}

#[derive(Default)]
pub struct ServerOptions {
    /// TOML written to a temp file and passed with `--config`.
    pub config: Option<String>,
    pub read_only: bool,
    /// Extra CLI flags, passed through as-is.
    pub args: Vec<String>,
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with(ServerOptions::default())
    }

    /// Spawns kinetic-server on an unused port and waits (up to 5 seconds)
    /// for it to accept connections.
    pub fn start_with(opts: ServerOptions) -> Self {
        let port = unused_port();
        let binary = server_binary();

        let mut cmd = Command::new(&binary);
        cmd.args(["--host", "127.0.0.1", "--exec-threads", "2"])
            .arg("--port")
            .arg(port.to_string())
            .env("RUST_LOG", "error");

        let config = opts.config.map(|toml| {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(toml.as_bytes()).unwrap();
            cmd.arg("--config").arg(file.path());
            file
        });
        if opts.read_only {
            cmd.arg("--read-only");
        }
        cmd.args(&opts.args);

        let child = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("can't run {}: {e}", binary.display()));

        let started = Instant::now();
        while std::net::TcpStream::connect(("127.0.0.1", port)).is_err() {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "kinetic-server not listening on {port} after 5s"
            );
            std::thread::sleep(Duration::from_millis(25));
        }

        Self {
            child,
            port,
            _config: config,
        }
    }

    pub async fn connect(&self) -> TestClient {
        let stream = TcpStream::connect(("127.0.0.1", self.port))
            .await
            .unwrap_or_else(|e| panic!("connect to port {}: {e}", self.port));
        TestClient {
            stream,
            buf: BytesMut::new(),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

/// A minimal client that sends commands as RESP arrays and decodes the
/// six-element response arrays.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    /// Writes a command without waiting for an answer. Batch members get
    /// none.
    pub async fn send(&mut self, args: &[&str]) {
        let mut wire = BytesMut::new();
        Frame::command(args).serialize(&mut wire);
        self.stream.write_all(&wire).await.unwrap();
    }

    /// Sends a command and returns the next response.
    pub async fn cmd(&mut self, args: &[&str]) -> Response {
        self.send(args).await;
        self.read_response().await
    }

    pub async fn read_response(&mut self) -> Response {
        match tokio::time::timeout(Duration::from_secs(10), self.next_response()).await {
            Ok(Some(resp)) => resp,
            Ok(None) => panic!("server closed connection while waiting for response"),
            Err(_) => panic!("timed out waiting for response"),
        }
    }

    /// Reads until the server closes the connection, returning whatever
    /// responses arrived first.
    pub async fn read_until_closed(&mut self) -> Vec<Response> {
        let mut seen = Vec::new();
        let drain = async {
            while let Some(resp) = self.next_response().await {
                seen.push(resp);
            }
        };
        tokio::time::timeout(Duration::from_secs(10), drain)
            .await
            .expect("server did not close the connection");
        seen
    }

    async fn next_response(&mut self) -> Option<Response> {
        loop {
            if let Some((frame, used)) = parse_frame(&self.buf).expect("bad frame from server") {
                self.buf.advance(used);
                return Some(decode_response(frame).expect("bad response shape"));
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }
}

fn unused_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

/// The server binary lives one level above the test binary's `deps/`.
pub fn server_binary() -> PathBuf {
    let exe = std::env::current_exe().unwrap();
    let mut path = exe.parent().unwrap().to_path_buf();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push(format!("kinetic-server{}", std::env::consts::EXE_SUFFIX));
    if !path.exists() {
        panic!(
            "kinetic-server binary not found. run `cargo build` first.\nlooked at: {}",
            path.display()
        );
    }
    path
}
