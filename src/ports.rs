use log::debug;
use std::{
    collections::BTreeSet,
    fs,
    io::ErrorKind,
    net::{SocketAddr, TcpListener},
};

use crate::shell::{self, Capture};

const TCP_LISTEN: &str = "0A";

/// Whether something already holds `addr`.
pub fn port_is_bound(addr: SocketAddr) -> bool {
    match TcpListener::bind(addr) {
        Ok(_) => false,
        Err(e) => e.kind() == ErrorKind::AddrInUse,
    }
}

/// PIDs of processes listening on a TCP port.
///
/// Uses `lsof` when installed, otherwise walks `/proc`.
pub fn pids_on_port(port: u16) -> Vec<i32> {
    if shell::have_cmd("lsof") {
        let spec = format!("tcp:{port}");
        if let Ok((_, out)) = shell::run("lsof", &["-t", "-i", spec.as_str(), "-sTCP:LISTEN"], Capture::Stdout) {
            let pids = parse_pid_lines(&out);
            if !pids.is_empty() {
                return pids;
            }
        }
    }
    let pids = pids_on_port_procfs(port);
    debug!("procfs port lookup {port}: {pids:?}");
    pids
}

fn parse_pid_lines(out: &str) -> Vec<i32> {
    let mut pids: Vec<i32> = out
        .split_whitespace()
        .filter_map(|s| s.trim().parse::<i32>().ok())
        .filter(|p| *p > 1 && *p as u32 != std::process::id())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Socket inodes of LISTEN entries for `port` in a `/proc/net/tcp`-style table.
pub(crate) fn listen_inodes(table: &str, port: u16) -> BTreeSet<u64> {
    let mut out = BTreeSet::new();
    for line in table.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 10 || cols[3] != TCP_LISTEN {
            continue;
        }
        let Some((_, port_hex)) = cols[1].rsplit_once(':') else {
            continue;
        };
        if u16::from_str_radix(port_hex, 16).ok() != Some(port) {
            continue;
        }
        if let Ok(inode) = cols[9].parse::<u64>() {
            if inode != 0 {
                out.insert(inode);
            }
        }
    }
    out
}

fn pids_on_port_procfs(port: u16) -> Vec<i32> {
    let mut inodes = BTreeSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(s) = fs::read_to_string(table) {
            inodes.extend(listen_inodes(&s, port));
        }
    }
    if inodes.is_empty() {
        return Vec::new();
    }

    let self_pid = std::process::id() as i32;
    let mut pids = Vec::new();
    let Ok(rd) = fs::read_dir("/proc") else {
        return pids;
    };
    for ent in rd.flatten() {
        let Some(pid) = ent.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if pid <= 1 || pid == self_pid {
            continue;
        }
        let Ok(fds) = fs::read_dir(ent.path().join("fd")) else {
            continue;
        };
        let holds = fds.flatten().any(|fd| {
            fs::read_link(fd.path())
                .ok()
                .and_then(|target| {
                    target
                        .to_str()
                        .and_then(|t| t.strip_prefix("socket:["))
                        .and_then(|t| t.strip_suffix(']'))
                        .and_then(|t| t.parse::<u64>().ok())
                })
                .is_some_and(|inode| inodes.contains(&inode))
        });
        if holds {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids
}
