#![allow(dead_code)]

use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::process::{Command, Output};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

pub enum MockResponse {
    Json(serde_json::Value),
    Text(String),
    Status(u16, serde_json::Value),
    Unauthorized,
}

impl MockResponse {
    pub fn into_http_string(self) -> String {
        match self {
            MockResponse::Json(val) => http(200, "OK", "application/json", &val.to_string()),
            MockResponse::Text(body) => http(200, "OK", "text/plain", &body),
            MockResponse::Status(code, val) => {
                http(code, reason(code), "application/json", &val.to_string())
            }
            MockResponse::Unauthorized => http(
                401,
                "Unauthorized",
                "application/json",
                r#"{"detail":"Not authenticated"}"#,
            ),
        }
    }
}

fn reason(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        402 => "Payment Required",
        404 => "Not Found",
        409 => "Conflict",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

fn http(code: u16, reason: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\r\n{}",
        code,
        reason,
        content_type,
        body.len(),
        body
    )
}

/// One request as seen by the scripted server.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub head: String,
    pub body: String,
}

impl Recorded {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("request body is json")
    }
}

pub struct TestHarness {
    pub tempdir: TempDir,
    pub server_url: String,
    server_handle: Option<std::thread::JoinHandle<Vec<Recorded>>>,
}

impl TestHarness {
    pub fn new(script: Vec<MockResponse>) -> Self {
        let tempdir = TempDir::new().expect("create tempdir");
        let (server_url, server_handle) = spawn_scripted_server(script);
        Self {
            tempdir,
            server_url,
            server_handle: Some(server_handle),
        }
    }

    /// Create a harness without a server (for tests that don't need backend)
    pub fn new_no_server() -> Self {
        let tempdir = TempDir::new().expect("create tempdir");
        Self {
            tempdir,
            server_url: "http://127.0.0.1:9".to_string(),
            server_handle: None,
        }
    }

    pub fn run_cli_and_assert_success(&mut self, args: &[&str]) -> (Output, Vec<Recorded>) {
        let output = self.run_cli(args);
        let requests = self.join_server();

        if !output.status.success() {
            eprintln!("=== CLI STDOUT ===\n{}", String::from_utf8_lossy(&output.stdout));
            eprintln!("=== CLI STDERR ===\n{}", String::from_utf8_lossy(&output.stderr));
            eprintln!("=== SERVER REQUESTS ===");
            for (i, r) in requests.iter().enumerate() {
                eprintln!("--- Request {} ---\n{}\n{}\n", i, r.head, r.body);
            }
            panic!("CLI failed unexpectedly");
        }

        (output, requests)
    }

    pub fn run_cli(&self, args: &[&str]) -> Output {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_vpsdeck"));
        cmd.env("VPSDECK_CONFIG_DIR", self.tempdir.path());
        cmd.env("VPSDECK_BACKEND", &self.server_url);
        cmd.env_remove("VPSDECK_TOKEN");
        cmd.env_remove("RUST_LOG");
        cmd.args(args);
        cmd.output().expect("run vpsdeck cli")
    }

    pub fn join_server(&mut self) -> Vec<Recorded> {
        if let Some(handle) = self.server_handle.take() {
            handle.join().unwrap()
        } else {
            Vec::new()
        }
    }

    pub fn save_token(&self, token: &str) {
        let dir = self.tempdir.path().join("vpsdeck");
        fs::create_dir_all(&dir).unwrap();
        let credentials = json!({ "token": token, "saved_at": "2025-10-19T08:00:00Z" });
        fs::write(
            dir.join("credentials.json"),
            serde_json::to_vec_pretty(&credentials).unwrap(),
        )
        .unwrap();
    }

    pub fn credentials_path(&self) -> std::path::PathBuf {
        self.tempdir.path().join("vpsdeck").join("credentials.json")
    }
}

fn read_request(stream: &mut std::net::TcpStream) -> Recorded {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let mut header_end = None;
    let mut content_length = 0usize;

    loop {
        if let Some(end) = header_end {
            if data.len() >= end + content_length {
                break;
            }
        }
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        data.extend_from_slice(&buf[..n]);
        if header_end.is_none() {
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                header_end = Some(pos + 4);
                let head = String::from_utf8_lossy(&data[..pos]).to_string();
                content_length = head
                    .lines()
                    .find_map(|line| {
                        let (key, value) = line.split_once(':')?;
                        key.trim()
                            .eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse().ok())?
                    })
                    .unwrap_or(0);
            }
        }
    }

    let end = header_end.unwrap_or(data.len());
    Recorded {
        head: String::from_utf8_lossy(&data[..end]).trim_end().to_string(),
        body: String::from_utf8_lossy(&data[end.min(data.len())..]).to_string(),
    }
}

/// Answers one scripted response per connection, in order.
fn spawn_scripted_server(
    responses: Vec<MockResponse>,
) -> (String, std::thread::JoinHandle<Vec<Recorded>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = std::thread::spawn(move || {
        let mut reqs = Vec::new();
        for response in responses {
            let (mut stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            reqs.push(read_request(&mut stream));
            let resp = response.into_http_string();
            stream.write_all(resp.as_bytes()).unwrap();
        }
        reqs
    });

    (format!("http://{}", addr), handle)
}

pub fn session_json(id: &str, status: &str, has_log: bool, created_at: &str) -> serde_json::Value {
    let route = has_log.then(|| format!("route-{}", id));
    json!({
        "id": id,
        "status": status,
        "has_log": has_log,
        "worker_route": route,
        "created_at": created_at,
        "product": { "id": "p1", "provision_action": 1 },
    })
}

pub fn catalog() -> serde_json::Value {
    json!([
        { "id": "p1", "name": "Linux Small", "price_coins": 20, "provision_action": 1 },
        { "id": "p2", "name": "Windows Desktop", "price_coins": 40, "provision_action": "2" },
    ])
}

/// Capacity pre-check answer with a free worker.
pub fn available() -> serde_json::Value {
    json!({
        "available": true,
        "workers": [{ "id": "w1", "name": "hn-1", "tokens_left": 4, "available": true }],
        "tokens_left": 4,
        "reason": null
    })
}
