//! Remote profile retrieval. Both backends are bounded by a timeout and take
//! the URL as a single argument, never as shell text.

use anyhow::{Context, Result};
use log::info;
use reqwest::blocking::Client;
use std::{
    ffi::OsString,
    fs,
    path::Path,
    time::Duration,
};

use crate::{
    config::{FetchBackend, FetchConfig},
    error::{TunupError, TunupResult},
    shell::{self, Capture},
};

pub trait Fetcher: Send + Sync {
    /// Fetch `url` into `dest`, returning the number of bytes written.
    ///
    /// `dest` may hold partial data on error; callers own cleanup.
    fn fetch(&self, url: &str, dest: &Path) -> TunupResult<u64>;
}

pub fn validate_url(url: &str) -> TunupResult<&str> {
    let url = url.trim();
    let lower = url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("http://")
        .or_else(|| lower.strip_prefix("https://"));
    match rest {
        Some(r) if !r.is_empty() && !url.chars().any(char::is_whitespace) => Ok(url),
        _ => Err(TunupError::InvalidUrl(url.to_string())),
    }
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> TunupResult<u64> {
        let url = validate_url(url)?;
        info!("GET {url}");
        let mut resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| TunupError::DownloadFailed(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(TunupError::DownloadFailed(format!(
                "HTTP {} for {url}",
                resp.status()
            )));
        }
        let mut f = fs::File::create(dest)
            .map_err(|e| TunupError::io(format!("create {}", dest.display()), e))?;
        let n = resp
            .copy_to(&mut f)
            .map_err(|e| TunupError::DownloadFailed(format!("read body {url}: {e}")))?;
        if n == 0 {
            return Err(TunupError::DownloadFailed(format!("empty download: {url}")));
        }
        Ok(n)
    }
}

pub struct CurlFetcher {
    timeout: Duration,
}

impl CurlFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Fetcher for CurlFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> TunupResult<u64> {
        let url = validate_url(url)?;
        let args: Vec<OsString> = vec![
            "-fsSL".into(),
            "--max-time".into(),
            self.timeout.as_secs().max(1).to_string().into(),
            "-o".into(),
            dest.as_os_str().to_owned(),
            url.into(),
        ];
        // curl enforces --max-time itself; the outer limit only catches a wedged process.
        let outer = self.timeout + Duration::from_secs(5);
        let (code, out) = shell::run_timeout("curl", &args, Capture::Stderr, outer)
            .map_err(|e| TunupError::DownloadFailed(format!("{e:#}")))?;
        if code != 0 {
            return Err(TunupError::DownloadFailed(format!(
                "curl exited with status {code}: {}",
                out.trim()
            )));
        }
        let n = fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
        if n == 0 {
            return Err(TunupError::DownloadFailed(format!("empty download: {url}")));
        }
        Ok(n)
    }
}

pub fn from_config(cfg: &FetchConfig) -> Result<Box<dyn Fetcher>> {
    let timeout = Duration::from_secs(cfg.timeout_secs.max(1));
    Ok(match cfg.backend {
        FetchBackend::Http => Box::new(HttpFetcher::new(timeout, &cfg.user_agent)?),
        FetchBackend::Curl => Box::new(CurlFetcher::new(timeout)),
    })
}
