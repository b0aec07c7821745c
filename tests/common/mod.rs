#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs,
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use tunup::{
    fetch::Fetcher,
    server::{self, ServerContext},
    service::ServiceControl,
    store::ProfileStore,
    TunupError, TunupResult,
};

pub const WORK_BODY: &str = "proxies:\n  - name: p1\n    type: ss\nproxy-groups:\n  - name: g1\n    proxies: [p1]\nrules:\n  - MATCH,g1\n";

pub const TEMPLATE: &str = "port: 7890\nmode: rule\nproxies: []\nproxy-groups: []\nrules: []\ndns:\n  enable: true\n";

/// Canned responses by URL. Unknown URLs leave a truncated file behind and fail.
#[derive(Default)]
pub struct StaticFetcher {
    bodies: Mutex<HashMap<String, String>>,
    pub calls: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn with(url: &str, body: &str) -> Arc<Self> {
        let f = Arc::new(Self::default());
        f.set(url, body);
        f
    }

    pub fn set(&self, url: &str, body: &str) {
        self.bodies.lock().unwrap().insert(url.into(), body.into());
    }

    pub fn forget(&self, url: &str) {
        self.bodies.lock().unwrap().remove(url);
    }
}

impl Fetcher for StaticFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> TunupResult<u64> {
        self.calls.lock().unwrap().push(url.to_string());
        match self.bodies.lock().unwrap().get(url) {
            Some(b) => {
                fs::write(dest, b).unwrap();
                Ok(b.len() as u64)
            }
            None => {
                fs::write(dest, "proxies: [p1").unwrap();
                Err(TunupError::DownloadFailed(format!("connection reset by {url}")))
            }
        }
    }
}

/// Records `verb name` for every systemctl-equivalent call.
#[derive(Default)]
pub struct RecordingServices {
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl ServiceControl for RecordingServices {
    fn command(&self, verb: &str, name: &str) -> i32 {
        self.calls.lock().unwrap().push(format!("{verb} {name}"));
        0
    }

    fn query(&self, verb: &str, _name: &str) -> Option<String> {
        Some(if verb == "is-active" { "active" } else { "enabled" }.to_string())
    }

    fn daemon_reload(&self) -> i32 {
        self.calls.lock().unwrap().push("daemon-reload".to_string());
        0
    }
}

pub fn spawn_server(dir: &Path, fetcher: Arc<dyn Fetcher>, max_body: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = ServerContext {
        store: ProfileStore::new(dir),
        fetcher,
        max_body,
    };
    thread::spawn(move || {
        let _ = server::serve(listener, ctx);
    });
    addr
}

/// A port nobody listens on right now.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn wait_for_listener(addr: SocketAddr, limit: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if TcpStream::connect(addr).is_ok() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

pub struct Reply {
    pub status: u16,
    pub body: String,
}

pub fn send(addr: SocketAddr, raw: &[u8]) -> Reply {
    let mut s = TcpStream::connect(addr).unwrap();
    s.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    s.write_all(raw).unwrap();
    let mut out = Vec::new();
    s.read_to_end(&mut out).unwrap();
    let text = String::from_utf8_lossy(&out).into_owned();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    Reply { status, body }
}

pub fn get(addr: SocketAddr, path: &str) -> Reply {
    send(
        addr,
        format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes(),
    )
}

pub enum Part<'a> {
    Field(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

pub fn post_form(addr: SocketAddr, parts: &[Part<'_>]) -> Reply {
    const BOUNDARY: &str = "----tunupTestBoundary7MA4YWxk";
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Field(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}").as_bytes(),
                );
            }
            Part::File(name, filename, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: application/x-yaml\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    let mut raw = format!(
        "POST / HTTP/1.1\r\nHost: {addr}\r\nContent-Type: multipart/form-data; boundary={BOUNDARY}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(&body);
    send(addr, &raw)
}

pub fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}
