//! Refresh policy for download profiles.

use log::warn;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{
    acquire::{self, Acquired},
    error::TunupResult,
    fetch::Fetcher,
    logging,
    store::{ProfileMeta, ProfileStore},
};

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Due when an interval is set and at least that much time has passed.
/// An interval of 0 means manual refresh only.
pub fn should_refresh(meta: &ProfileMeta, now: u64) -> bool {
    let interval = meta.update_interval_secs();
    interval > 0 && now.saturating_sub(meta.last_update()) >= interval
}

/// Seconds until `meta` becomes due, or `None` when it never auto-refreshes.
pub fn seconds_until_due(meta: &ProfileMeta, now: u64) -> Option<u64> {
    let interval = meta.update_interval_secs();
    if interval == 0 {
        return None;
    }
    Some(meta.last_update().saturating_add(interval).saturating_sub(now))
}

#[derive(Debug)]
pub struct RefreshRun {
    pub refreshed: Vec<Acquired>,
    pub failed: Vec<(String, String)>,
}

/// Refresh every profile whose interval has elapsed.
///
/// Failures are collected, not propagated; one bad source does not stop the rest.
pub fn refresh_due(store: &ProfileStore, fetcher: &dyn Fetcher, now: u64) -> TunupResult<RefreshRun> {
    let mut run = RefreshRun {
        refreshed: Vec::new(),
        failed: Vec::new(),
    };
    for name in store.list_profiles()? {
        let meta = match store.read_meta(&name) {
            Ok(m) => m,
            Err(e) => {
                logging::backend(&format!("skip {name}: {e}"));
                continue;
            }
        };
        if !should_refresh(&meta, now) {
            continue;
        }
        logging::backend(&format!("refresh due for {name}"));
        match acquire::refresh(store, fetcher, &name, now) {
            Ok(a) => run.refreshed.push(a),
            Err(e) => {
                warn!("refresh {name} failed: {e}");
                run.failed.push((name, e.to_string()));
            }
        }
    }
    Ok(run)
}
