use anyhow::{anyhow, Result};
use log::{debug, info};
use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

#[derive(Clone, Copy, Debug)]
pub enum Capture {
    Stdout,
    Stderr,
    Both,
    None,
}

impl Capture {
    fn wants_stdout(self) -> bool {
        matches!(self, Capture::Stdout | Capture::Both)
    }

    fn wants_stderr(self) -> bool {
        matches!(self, Capture::Stderr | Capture::Both)
    }
}

fn describe<S: AsRef<OsStr>>(cmd: &str, args: &[S]) -> String {
    let mut line = cmd.to_string();
    for a in args {
        line.push(' ');
        line.push_str(&a.as_ref().to_string_lossy());
    }
    line
}

fn tmp_capture_path(cmd: &str, suffix: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_nanos();
    let safe = cmd.replace('/', "_");
    std::env::temp_dir().join(format!(
        "tunup_{safe}_{}_{ts}.{suffix}",
        std::process::id()
    ))
}

fn drain(path: Option<&Path>, out: &mut String) {
    if let Some(p) = path {
        if let Ok(buf) = fs::read(p) {
            out.push_str(&String::from_utf8_lossy(&buf));
        }
        let _ = fs::remove_file(p);
    }
}

/// Run a command and wait for it.
///
/// Arguments are passed as a vector; nothing is ever handed to a shell.
pub fn run<S: AsRef<OsStr>>(cmd: &str, args: &[S], capture: Capture) -> Result<(i32, String)> {
    info!("exec: {}", describe(cmd, args));
    let mut c = Command::new(cmd);
    c.args(args).stdin(Stdio::null());
    if !capture.wants_stdout() {
        c.stdout(Stdio::null());
    }
    if !capture.wants_stderr() {
        c.stderr(Stdio::null());
    }

    let out = c.output().map_err(|e| anyhow!("failed to run {cmd}: {e}"))?;
    let code = out.status.code().unwrap_or(-1);

    let mut s = String::new();
    if capture.wants_stdout() {
        s.push_str(&String::from_utf8_lossy(&out.stdout));
    }
    if capture.wants_stderr() {
        s.push_str(&String::from_utf8_lossy(&out.stderr));
    }
    debug!("exit={code} output_len={}", s.len());
    Ok((code, s))
}

/// Run a command with a timeout.
///
/// Output goes through temp files so a chatty child cannot fill a pipe and stall.
/// On timeout the child is killed and an error carrying the partial output is returned.
pub fn run_timeout<S: AsRef<OsStr>>(
    cmd: &str,
    args: &[S],
    capture: Capture,
    timeout: Duration,
) -> Result<(i32, String)> {
    info!("exec(timeout={timeout:?}): {}", describe(cmd, args));

    let stdout_path = capture.wants_stdout().then(|| tmp_capture_path(cmd, "out"));
    let stderr_path = capture.wants_stderr().then(|| tmp_capture_path(cmd, "err"));

    let mut c = Command::new(cmd);
    c.args(args).stdin(Stdio::null());
    match &stdout_path {
        Some(p) => {
            let f = fs::File::create(p)
                .map_err(|e| anyhow!("failed to create stdout temp file {p:?}: {e}"))?;
            c.stdout(Stdio::from(f));
        }
        None => {
            c.stdout(Stdio::null());
        }
    }
    match &stderr_path {
        Some(p) => {
            let f = fs::File::create(p)
                .map_err(|e| anyhow!("failed to create stderr temp file {p:?}: {e}"))?;
            c.stderr(Stdio::from(f));
        }
        None => {
            c.stderr(Stdio::null());
        }
    }

    let mut child = match c.spawn() {
        Ok(child) => child,
        Err(e) => {
            let mut ignored = String::new();
            drain(stdout_path.as_deref(), &mut ignored);
            drain(stderr_path.as_deref(), &mut ignored);
            return Err(anyhow!("failed to spawn {cmd}: {e}"));
        }
    };
    let start = Instant::now();

    loop {
        let status = child
            .try_wait()
            .map_err(|e| anyhow!("failed to wait {cmd}: {e}"))?;
        if let Some(st) = status {
            let code = st.code().unwrap_or(-1);
            let mut s = String::new();
            drain(stdout_path.as_deref(), &mut s);
            drain(stderr_path.as_deref(), &mut s);
            debug!("exit={code} output_len={} (timeout wrapper)", s.len());
            return Ok((code, s));
        }

        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            let mut s = String::new();
            drain(stdout_path.as_deref(), &mut s);
            drain(stderr_path.as_deref(), &mut s);
            return Err(anyhow!(
                "command timeout after {timeout:?}: {}\n{s}",
                describe(cmd, args)
            ));
        }

        thread::sleep(Duration::from_millis(50));
    }
}

/// True when `cmd` can be found on `PATH`.
pub fn have_cmd(cmd: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(cmd).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout_and_exit_code() {
        let (code, out) = run("sh", &["-c", "echo hello; exit 3"], Capture::Stdout).unwrap();
        assert_eq!(code, 3);
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn arguments_are_not_interpreted() {
        let (code, out) = run("echo", &["a; echo injected"], Capture::Stdout).unwrap();
        assert_eq!(code, 0);
        assert_eq!(out.trim(), "a; echo injected");
    }

    #[test]
    fn run_timeout_kills_slow_child() {
        let err = run_timeout("sleep", &["5"], Capture::Both, Duration::from_millis(200))
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn run_timeout_returns_output() {
        let (code, out) = run_timeout(
            "sh",
            &["-c", "echo out; echo err 1>&2"],
            Capture::Both,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(code, 0);
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }
}
