//! The profile server: one HTML control page plus the download and upload
//! actions posted from it.
//!
//! Connections are handled one at a time on the accepting thread, so two
//! requests never write into the profile directory concurrently.

mod multipart;
pub mod page;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    time::Duration,
};

use crate::{
    acquire,
    error::TunupError,
    fetch::Fetcher,
    scheduler::unix_now,
    store::ProfileStore,
};

use self::page::{Page, Status, Tab};

const MAX_HEADER: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub const DOWNLOAD_OK: &str = "File downloaded successfully.";
pub const UPLOAD_OK: &str = "File uploaded successfully.";

#[derive(Debug)]
struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

struct Response {
    status: u16,
    body: String,
}

impl Response {
    fn page(status: u16, page: &Page) -> Self {
        Self {
            status,
            body: page.render(),
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct ServerContext {
    pub store: ProfileStore,
    pub fetcher: Arc<dyn Fetcher>,
    pub max_body: usize,
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

enum ReadError {
    TooLarge,
    Other(anyhow::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        ReadError::Other(e.into())
    }
}

fn read_request(s: &mut TcpStream, max_body: usize) -> Result<Request, ReadError> {
    s.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut data = Vec::with_capacity(2048);
    let mut buf = [0_u8; 4096];

    let header_end = loop {
        if let Some(end) = find_header_end(&data) {
            break end;
        }
        if data.len() >= MAX_HEADER {
            return Err(ReadError::Other(anyhow::anyhow!("HTTP header too large")));
        }
        let n = s.read(&mut buf)?;
        if n == 0 {
            return Err(ReadError::Other(anyhow::anyhow!("connection closed mid-header")));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end - 4]).into_owned();
    let mut lines = head.split("\r\n");
    let mut it = lines.next().unwrap_or("").split_whitespace();
    let method = it.next().unwrap_or("").to_string();
    let path = it.next().unwrap_or("").to_string();

    let mut headers = HashMap::new();
    for l in lines {
        if let Some((k, v)) = l.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let mut body = data[header_end..].to_vec();
    let len = match headers.get("content-length") {
        Some(cl) => cl
            .trim()
            .parse::<usize>()
            .map_err(|_| ReadError::Other(anyhow::anyhow!("bad content-length {cl:?}")))?,
        None => 0,
    };
    if len > max_body {
        return Err(ReadError::TooLarge);
    }
    while body.len() < len {
        let n = s.read(&mut buf)?;
        if n == 0 {
            return Err(ReadError::Other(anyhow::anyhow!(
                "connection closed after {} of {len} body bytes",
                body.len()
            )));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(len);

    Ok(Request {
        method,
        path,
        headers,
        body,
    })
}

fn write_response(s: &mut TcpStream, resp: &Response) -> Result<()> {
    let content_type = if resp.body.is_empty() {
        ""
    } else {
        "Content-Type: text/html; charset=utf-8\r\n"
    };
    let hdr = format!(
        "HTTP/1.1 {} {}\r\n{content_type}Content-Length: {}\r\nConnection: close\r\n\r\n",
        resp.status,
        reason(resp.status),
        resp.body.len()
    );
    s.write_all(hdr.as_bytes())?;
    s.write_all(resp.body.as_bytes())?;
    s.flush()?;
    Ok(())
}

fn handle_download(ctx: &ServerContext, form: &multipart::Form) -> Page {
    let mut page = Page {
        tab: Tab::Download,
        name: form.text("name").to_string(),
        url: form.text("url").to_string(),
        interval: form.text("interval").to_string(),
        status: None,
    };
    if page.interval.is_empty() {
        page.interval = "0".to_string();
    }

    let result = page
        .interval
        .parse::<u64>()
        .map_err(|_| TunupError::DownloadFailed(format!("invalid update interval `{}`", page.interval)))
        .and_then(|interval| {
            acquire::download(
                &ctx.store,
                ctx.fetcher.as_ref(),
                &page.name,
                &page.url,
                interval,
                unix_now(),
            )
        });

    page.status = Some(match result {
        Ok(a) => {
            info!("download {} ok ({} bytes)", a.name, a.bytes);
            Status::ok(DOWNLOAD_OK)
        }
        Err(e) => Status::err(format!("Error downloading file: {e}")),
    });
    page
}

fn handle_upload(ctx: &ServerContext, form: &multipart::Form) -> Page {
    let mut page = Page {
        tab: Tab::Upload,
        name: form.text("name").to_string(),
        ..Default::default()
    };

    let Some(file) = form.file("file") else {
        page.status = Some(Status::err("Error uploading file: no file selected"));
        return page;
    };
    page.status = Some(
        match acquire::upload(&ctx.store, &page.name, &file.filename, &file.data, unix_now()) {
            Ok(a) => {
                info!("upload {} ok ({} bytes)", a.name, a.bytes);
                Status::ok(UPLOAD_OK)
            }
            Err(e @ TunupError::InvalidFileType) => Status::err(e.to_string()),
            Err(e) => Status::err(format!("Error uploading file: {e}")),
        },
    );
    page
}

fn handle_post(ctx: &ServerContext, req: &Request) -> Response {
    let ct = req.headers.get("content-type").map(String::as_str).unwrap_or("");
    let form = match multipart::parse(ct, &req.body) {
        Ok(f) => f,
        Err(e) => {
            warn!("rejecting POST: {e:#}");
            let page = Page {
                status: Some(Status::err(format!("Bad request: {e}"))),
                ..Default::default()
            };
            return Response::page(400, &page);
        }
    };

    match form.text("action") {
        "download" => Response::page(200, &handle_download(ctx, &form)),
        "upload" => Response::page(200, &handle_upload(ctx, &form)),
        other => {
            warn!("unknown action {other:?}");
            let page = Page {
                name: form.text("name").to_string(),
                status: Some(Status::err(format!("Unknown action `{other}`."))),
                ..Default::default()
            };
            Response::page(400, &page)
        }
    }
}

fn route(ctx: &ServerContext, req: &Request) -> Response {
    let path = req.path.split('?').next().unwrap_or("");
    if path != "/" {
        return Response::empty(404);
    }
    match req.method.as_str() {
        "GET" => Response::page(200, &Page::default()),
        "POST" => handle_post(ctx, req),
        _ => Response::empty(405),
    }
}

fn handle_connection(mut stream: TcpStream, ctx: &ServerContext) -> Result<()> {
    let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));
    let resp = match read_request(&mut stream, ctx.max_body) {
        Ok(req) => {
            debug!("{} {} ({} body bytes)", req.method, req.path, req.body.len());
            route(ctx, &req)
        }
        Err(ReadError::TooLarge) => Response::empty(413),
        Err(ReadError::Other(e)) => return Err(e),
    };
    write_response(&mut stream, &resp)
}

/// Accept and handle connections until the listener fails.
pub fn serve(listener: TcpListener, ctx: ServerContext) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("profile server listening on http://{addr}/ (profiles in {})", ctx.store.dir().display());
    }
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                if let Err(e) = handle_connection(stream, &ctx) {
                    debug!("connection {peer:?}: {e:#}");
                }
            }
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        }
    }
    bail!("listener closed")
}

pub fn bind_and_serve(addr: SocketAddr, ctx: ServerContext) -> Result<()> {
    ctx.store.ensure_dir()?;
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
    serve(listener, ctx)
}
