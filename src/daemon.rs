//! Long-running host loop: keeps the profile server up and refreshes due
//! profiles until SIGINT/SIGTERM.

use anyhow::Result;
use log::{error, info, warn};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use crate::{host::Host, logging, scheduler::unix_now};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

const POLL: Duration = Duration::from_millis(200);

extern "C" fn on_signal(_sig: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

/// One scheduler pass: restart a server that died, refresh what is due.
pub fn tick(host: &mut Host, now: u64) {
    if let Err(e) = host.ensure_server() {
        warn!("profile server not running: {e}");
    }
    match host.refresh_due(now) {
        Ok(run) => {
            for a in &run.refreshed {
                logging::backend(&format!("refreshed {} (changed={})", a.name, a.changed));
            }
            for (name, err) in &run.failed {
                warn!("refresh {name} failed: {err}");
            }
        }
        Err(e) => error!("refresh pass failed: {e:#}"),
    }
}

pub fn run(host: &mut Host) -> Result<()> {
    install_signal_handlers();
    let tick_every = Duration::from_secs(host.config().scheduler.tick_secs.max(1));
    info!(
        "tunup host starting (tick={}s, server={})",
        tick_every.as_secs(),
        host.config().server.addr()
    );

    let mut last_tick: Option<Instant> = None;
    while !stop_requested() {
        if last_tick.map_or(true, |t| t.elapsed() >= tick_every) {
            tick(host, unix_now());
            last_tick = Some(Instant::now());
        }
        thread::sleep(POLL);
    }

    info!("stop requested; shutting down");
    host.shutdown();
    Ok(())
}
