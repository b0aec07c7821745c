use log::{info, warn};
use std::{fs, path::Path, thread, time::Duration};

const POLL: Duration = Duration::from_millis(100);

/// A pid counts as alive while it exists and is not a zombie.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 1 {
        return false;
    }
    let stat = Path::new("/proc").join(pid.to_string()).join("stat");
    match fs::read_to_string(&stat) {
        // Field 3 follows the parenthesised comm, which may itself contain spaces.
        Ok(s) => match s.rfind(')') {
            Some(i) => !matches!(s[i + 1..].trim_start().chars().next(), Some('Z') | Some('X')),
            None => true,
        },
        Err(_) => unsafe { libc::kill(pid, 0) == 0 },
    }
}

pub fn send_signal(pid: i32, sig: libc::c_int) -> bool {
    if pid <= 1 {
        return false;
    }
    unsafe { libc::kill(pid, sig) == 0 }
}

/// Wait until every pid is gone or `limit` elapses. True when all exited.
pub fn wait_gone(pids: &[i32], limit: Duration) -> bool {
    let mut waited = Duration::ZERO;
    loop {
        if pids.iter().all(|p| !pid_alive(*p)) {
            return true;
        }
        if waited >= limit {
            return false;
        }
        thread::sleep(POLL);
        waited += POLL;
    }
}

/// SIGKILL each pid and wait briefly for the kernel to reap them.
///
/// Returns the pids that were still alive afterwards.
pub fn kill_pids(pids: &[i32]) -> Vec<i32> {
    for pid in pids {
        info!("kill -9 {pid}");
        if !send_signal(*pid, libc::SIGKILL) {
            warn!("kill -9 {pid} failed: {}", std::io::Error::last_os_error());
        }
    }
    wait_gone(pids, Duration::from_secs(1));
    pids.iter().copied().filter(|p| pid_alive(*p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn self_is_alive_and_pid_one_is_skipped() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(1));
        assert!(!pid_alive(0));
    }

    #[test]
    fn kill_reaps_detached_sleeper() {
        // `sh` backgrounds the sleeper and exits, so init adopts it.
        let out = Command::new("sh")
            .args(["-c", "sleep 30 >/dev/null 2>&1 & echo $!"])
            .output()
            .unwrap();
        let pid: i32 = String::from_utf8_lossy(&out.stdout).trim().parse().unwrap();
        assert!(pid_alive(pid));
        let left = kill_pids(&[pid]);
        assert!(left.is_empty());
        assert!(!pid_alive(pid));
    }
}
