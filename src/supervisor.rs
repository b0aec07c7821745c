//! Lifecycle of the profile server process.
//!
//! The supervisor owns the only handle to the server it started. A server left
//! behind by an earlier host session has no handle; it is found through the
//! port it still holds.

use log::{info, warn};
use std::{
    fs::OpenOptions,
    io,
    net::SocketAddr,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::{TunupError, TunupResult},
    logging, ports, process,
};

const POLL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(1);
const STARTUP_CHECK: Duration = Duration::from_millis(150);

pub trait ServerProcess: Send {
    fn id(&self) -> u32;
    fn is_alive(&mut self) -> bool;
    /// Ask for a graceful exit (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;
    /// Force exit (SIGKILL).
    fn kill(&mut self) -> io::Result<()>;

    /// Poll until the process exits or `limit` passes. True when it exited.
    fn wait_timeout(&mut self, limit: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_alive() {
                return true;
            }
            if start.elapsed() >= limit {
                return false;
            }
            thread::sleep(POLL);
        }
    }
}

impl ServerProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> io::Result<()> {
        if process::send_signal(Child::id(self) as i32, libc::SIGTERM) {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)
    }
}

pub trait Launcher: Send + Sync {
    fn launch(&self) -> TunupResult<Box<dyn ServerProcess>>;
}

/// Starts `<this executable> serve ...` as a detached session leader.
#[derive(Debug, Clone)]
pub struct SelfExecLauncher {
    pub exe: PathBuf,
    pub config: Option<PathBuf>,
    pub profiles_dir: PathBuf,
    pub addr: SocketAddr,
    pub log_file: Option<PathBuf>,
}

impl Launcher for SelfExecLauncher {
    fn launch(&self) -> TunupResult<Box<dyn ServerProcess>> {
        std::fs::create_dir_all(&self.profiles_dir)
            .map_err(|e| TunupError::io(format!("mkdir {}", self.profiles_dir.display()), e))?;

        let mut cmd = Command::new(&self.exe);
        if let Some(cfg) = &self.config {
            cmd.arg("--config").arg(cfg);
        }
        cmd.arg("serve")
            .arg("--bind")
            .arg(self.addr.ip().to_string())
            .arg("--port")
            .arg(self.addr.port().to_string())
            .arg("--profiles-dir")
            .arg(&self.profiles_dir)
            .current_dir(&self.profiles_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null());

        match &self.log_file {
            Some(p) => {
                let f = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)
                    .map_err(|e| TunupError::io(format!("open log {}", p.display()), e))?;
                cmd.stderr(Stdio::from(f));
            }
            None => {
                cmd.stderr(Stdio::inherit());
            }
        }

        unsafe {
            cmd.pre_exec(|| {
                let _ = libc::setsid();
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| TunupError::Supervision(format!("spawn {}: {e}", self.exe.display())))?;
        info!("spawned profile server pid={} addr={}", child.id(), self.addr);
        Ok(Box::new(child))
    }
}

/// Finds and removes whatever holds the server port.
pub trait PortProbe: Send + Sync {
    fn in_use(&self, addr: SocketAddr) -> bool;
    fn occupants(&self, port: u16) -> Vec<i32>;
    /// Force-kill `pids`; returns the ones that survived.
    fn kill(&self, pids: &[i32]) -> Vec<i32>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemPortProbe;

impl PortProbe for SystemPortProbe {
    fn in_use(&self, addr: SocketAddr) -> bool {
        ports::port_is_bound(addr)
    }

    fn occupants(&self, port: u16) -> Vec<i32> {
        ports::pids_on_port(port)
    }

    fn kill(&self, pids: &[i32]) -> Vec<i32> {
        process::kill_pids(pids)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Our own server exited; `forced` when it ignored SIGTERM.
    Stopped { pid: u32, forced: bool },
    /// No handle, but these processes held the port and were killed.
    ReclaimedPort { pids: Vec<i32> },
    NotRunning,
}

pub struct Supervisor {
    child: Option<Box<dyn ServerProcess>>,
    launcher: Box<dyn Launcher>,
    probe: Box<dyn PortProbe>,
    addr: SocketAddr,
    grace: Duration,
}

impl Supervisor {
    pub fn new(
        launcher: Box<dyn Launcher>,
        probe: Box<dyn PortProbe>,
        addr: SocketAddr,
        grace: Duration,
    ) -> Self {
        Self {
            child: None,
            launcher,
            probe,
            addr,
            grace,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// PID of the tracked server, if it is still alive.
    pub fn running_pid(&mut self) -> Option<u32> {
        let alive = self.child.as_mut().map(|c| c.is_alive())?;
        if alive {
            self.child.as_ref().map(|c| c.id())
        } else {
            let pid = self.child.take().map(|c| c.id());
            warn!("profile server pid={pid:?} exited on its own");
            None
        }
    }

    /// Idempotent: a live tracked server is left alone.
    pub fn start(&mut self) -> TunupResult<StartOutcome> {
        if let Some(pid) = self.running_pid() {
            logging::backend("Server is already running.");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }
        if self.probe.in_use(self.addr) {
            return Err(TunupError::PortInUse(self.addr.port()));
        }

        let mut child = self.launcher.launch()?;
        thread::sleep(STARTUP_CHECK);
        if !child.is_alive() {
            return Err(TunupError::Supervision(format!(
                "profile server pid={} exited right after start",
                child.id()
            )));
        }
        let pid = child.id();
        self.child = Some(child);
        logging::backend("Server started.");
        Ok(StartOutcome::Started { pid })
    }

    pub fn stop(&mut self) -> TunupResult<StopOutcome> {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            if child.is_alive() {
                return Ok(self.stop_tracked(child.as_mut(), pid));
            }
            warn!("tracked profile server pid={pid} had already exited");
        }

        logging::backend("Server is not running.");
        let pids = self.probe.occupants(self.addr.port());
        if pids.is_empty() {
            return Ok(StopOutcome::NotRunning);
        }
        warn!(
            "port {} held by untracked process(es) {:?}; killing",
            self.addr.port(),
            pids
        );
        let survivors = self.probe.kill(&pids);
        if !survivors.is_empty() {
            return Err(TunupError::Supervision(format!(
                "could not kill {survivors:?} holding port {}",
                self.addr.port()
            )));
        }
        logging::backend(&format!(
            "Killed another process using port {}.",
            self.addr.port()
        ));
        Ok(StopOutcome::ReclaimedPort { pids })
    }

    fn stop_tracked(&self, child: &mut dyn ServerProcess, pid: u32) -> StopOutcome {
        if let Err(e) = child.terminate() {
            warn!("SIGTERM pid={pid}: {e}");
        }
        if child.wait_timeout(self.grace) {
            logging::backend("Server stopped.");
            return StopOutcome::Stopped { pid, forced: false };
        }

        warn!("profile server pid={pid} ignored SIGTERM for {:?}; killing", self.grace);
        if let Err(e) = child.kill() {
            warn!("SIGKILL pid={pid}: {e}");
        }
        if !child.wait_timeout(KILL_WAIT) {
            warn!("profile server pid={pid} still present after SIGKILL");
        }
        StopOutcome::Stopped { pid, forced: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ProcState {
        alive: bool,
        ignores_term: bool,
        signals: Vec<&'static str>,
    }

    struct FakeProcess {
        pid: u32,
        st: Arc<Mutex<ProcState>>,
    }

    impl ServerProcess for FakeProcess {
        fn id(&self) -> u32 {
            self.pid
        }
        fn is_alive(&mut self) -> bool {
            self.st.lock().unwrap().alive
        }
        fn terminate(&mut self) -> io::Result<()> {
            let mut st = self.st.lock().unwrap();
            st.signals.push("TERM");
            if !st.ignores_term {
                st.alive = false;
            }
            Ok(())
        }
        fn kill(&mut self) -> io::Result<()> {
            let mut st = self.st.lock().unwrap();
            st.signals.push("KILL");
            st.alive = false;
            Ok(())
        }
    }

    struct FakeLauncher {
        st: Arc<Mutex<ProcState>>,
        launches: Arc<Mutex<u32>>,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self) -> TunupResult<Box<dyn ServerProcess>> {
            *self.launches.lock().unwrap() += 1;
            self.st.lock().unwrap().alive = true;
            Ok(Box::new(FakeProcess {
                pid: 4242,
                st: self.st.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct FakeProbe {
        occupants: Mutex<Vec<i32>>,
        killed: Arc<Mutex<Vec<i32>>>,
    }

    impl PortProbe for FakeProbe {
        fn in_use(&self, _addr: SocketAddr) -> bool {
            !self.occupants.lock().unwrap().is_empty()
        }
        fn occupants(&self, _port: u16) -> Vec<i32> {
            self.occupants.lock().unwrap().clone()
        }
        fn kill(&self, pids: &[i32]) -> Vec<i32> {
            self.killed.lock().unwrap().extend_from_slice(pids);
            self.occupants.lock().unwrap().clear();
            Vec::new()
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    fn supervisor(st: Arc<Mutex<ProcState>>, probe: FakeProbe) -> (Supervisor, Arc<Mutex<u32>>) {
        let launches = Arc::new(Mutex::new(0));
        let sup = Supervisor::new(
            Box::new(FakeLauncher {
                st,
                launches: launches.clone(),
            }),
            Box::new(probe),
            addr(),
            Duration::from_millis(200),
        );
        (sup, launches)
    }

    #[test]
    fn start_is_idempotent() {
        let st = Arc::new(Mutex::new(ProcState::default()));
        let (mut sup, launches) = supervisor(st, FakeProbe::default());
        assert_eq!(sup.start().unwrap(), StartOutcome::Started { pid: 4242 });
        assert_eq!(sup.start().unwrap(), StartOutcome::AlreadyRunning { pid: 4242 });
        assert_eq!(*launches.lock().unwrap(), 1);
    }

    #[test]
    fn stop_tracked_graceful() {
        let st = Arc::new(Mutex::new(ProcState::default()));
        let (mut sup, _) = supervisor(st.clone(), FakeProbe::default());
        sup.start().unwrap();
        assert_eq!(
            sup.stop().unwrap(),
            StopOutcome::Stopped {
                pid: 4242,
                forced: false
            }
        );
        assert_eq!(st.lock().unwrap().signals, vec!["TERM"]);
        assert_eq!(sup.stop().unwrap(), StopOutcome::NotRunning);
    }

    #[test]
    fn stop_escalates_when_term_is_ignored() {
        let st = Arc::new(Mutex::new(ProcState {
            ignores_term: true,
            ..Default::default()
        }));
        let (mut sup, _) = supervisor(st.clone(), FakeProbe::default());
        sup.start().unwrap();
        assert_eq!(
            sup.stop().unwrap(),
            StopOutcome::Stopped {
                pid: 4242,
                forced: true
            }
        );
        assert_eq!(st.lock().unwrap().signals, vec!["TERM", "KILL"]);
    }

    #[test]
    fn stop_without_handle_reclaims_port() {
        let st = Arc::new(Mutex::new(ProcState::default()));
        let probe = FakeProbe::default();
        probe.occupants.lock().unwrap().push(777);
        let killed = probe.killed.clone();
        let (mut sup, _) = supervisor(st.clone(), probe);

        assert_eq!(
            sup.stop().unwrap(),
            StopOutcome::ReclaimedPort { pids: vec![777] }
        );
        assert_eq!(*killed.lock().unwrap(), vec![777]);
        assert!(st.lock().unwrap().signals.is_empty());
    }

    #[test]
    fn start_refuses_foreign_port_holder() {
        let st = Arc::new(Mutex::new(ProcState::default()));
        let probe = FakeProbe::default();
        probe.occupants.lock().unwrap().push(777);
        let (mut sup, launches) = supervisor(st, probe);
        assert!(matches!(sup.start(), Err(TunupError::PortInUse(12345))));
        assert_eq!(*launches.lock().unwrap(), 0);

        sup.stop().unwrap();
        assert!(matches!(sup.start(), Ok(StartOutcome::Started { .. })));
    }

    #[test]
    fn dead_handle_is_dropped_and_port_checked() {
        let st = Arc::new(Mutex::new(ProcState::default()));
        let (mut sup, launches) = supervisor(st.clone(), FakeProbe::default());
        sup.start().unwrap();
        st.lock().unwrap().alive = false;
        assert_eq!(sup.running_pid(), None);
        assert_eq!(sup.stop().unwrap(), StopOutcome::NotRunning);
        sup.start().unwrap();
        assert_eq!(*launches.lock().unwrap(), 2);
    }
}
