//! Plugin-facing operations. The host process owns one `Host` for its whole
//! lifetime; the front-end bridge calls into it by way of the CLI.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    acquire::{self, Acquired},
    config::Config,
    error::{TunupError, TunupResult},
    fetch::{self, Fetcher},
    logging,
    merge::{ConfigMerger, MergeReport},
    scheduler::{self, RefreshRun},
    service::{ServiceControl, ServiceStatus, Systemctl},
    settings::{self, Settings},
    store::ProfileStore,
    supervisor::{SelfExecLauncher, StartOutcome, StopOutcome, Supervisor, SystemPortProbe},
};

/// Tunnel binary shipped in the assets directory.
pub const ASSET_BINARY: &str = "clash";
pub const ASSET_GEOIP: &str = "Country.mmdb";
pub const ASSET_WEB_DIR: &str = "web";

#[derive(Debug, Clone, Serialize)]
pub struct ProfileInfo {
    pub name: String,
    /// `download` / `upload`; absent when the metadata is missing or unreadable.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub url: Option<String>,
    pub update_interval: u64,
    pub update_time: Option<u64>,
    pub next_refresh_in: Option<u64>,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub selected: Option<String>,
    pub profiles: usize,
    pub config_path: PathBuf,
    pub server: ServerStatus,
    pub service: ServiceStatus,
}

#[derive(Debug)]
pub struct RefreshOutcome {
    pub acquired: Acquired,
    /// Set when the refreshed profile is the selected one and was re-merged.
    pub merged: Option<MergeReport>,
}

pub struct Host {
    cfg: Config,
    store: ProfileStore,
    merger: ConfigMerger,
    fetcher: Arc<dyn Fetcher>,
    services: Box<dyn ServiceControl>,
    supervisor: Supervisor,
}

impl Host {
    /// Wire the production collaborators: HTTP/curl fetcher, systemctl, and a
    /// supervisor that re-executes this binary as `serve`.
    pub fn new(cfg: Config, config_file: Option<PathBuf>) -> Result<Self> {
        let fetcher: Arc<dyn Fetcher> = Arc::from(fetch::from_config(&cfg.fetch)?);
        let launcher = SelfExecLauncher {
            exe: std::env::current_exe().context("locate own executable")?,
            config: config_file,
            profiles_dir: cfg.paths.profiles_dir.clone(),
            addr: cfg.server.addr(),
            log_file: cfg.log.file.clone(),
        };
        let supervisor = Supervisor::new(
            Box::new(launcher),
            Box::new(SystemPortProbe),
            cfg.server.addr(),
            Duration::from_millis(cfg.server.stop_grace_ms),
        );
        Ok(Self::with_parts(cfg, fetcher, Box::new(Systemctl), supervisor))
    }

    pub fn with_parts(
        cfg: Config,
        fetcher: Arc<dyn Fetcher>,
        services: Box<dyn ServiceControl>,
        supervisor: Supervisor,
    ) -> Self {
        let store = ProfileStore::new(&cfg.paths.profiles_dir);
        let merger = ConfigMerger::new(cfg.paths.template_path(), cfg.paths.active_config_path());
        Self {
            cfg,
            store,
            merger,
            fetcher,
            services,
            supervisor,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    fn settings(&self) -> Result<Settings> {
        settings::load(&self.cfg.paths.settings_file)
    }

    pub fn selected(&self) -> Result<Option<String>> {
        Ok(self.settings()?.selected().map(str::to_string))
    }

    pub fn profiles(&self, now: u64) -> Result<Vec<ProfileInfo>> {
        let selected = self.selected()?;
        let mut out = Vec::new();
        for name in self.store.list_profiles()? {
            let meta = self.store.read_meta(&name).ok();
            out.push(ProfileInfo {
                selected: selected.as_deref() == Some(name.as_str()),
                kind: meta.as_ref().map(|m| m.kind().to_string()),
                url: meta.as_ref().and_then(|m| m.source_url()).map(str::to_string),
                update_interval: meta.as_ref().map_or(0, |m| m.update_interval_secs()),
                update_time: meta.as_ref().map(|m| m.last_update()),
                next_refresh_in: meta
                    .as_ref()
                    .and_then(|m| scheduler::seconds_until_due(m, now)),
                name,
            });
        }
        Ok(out)
    }

    fn activate(&self, name: &str) -> TunupResult<MergeReport> {
        let (report, code) =
            self.merger
                .activate(&self.store, name, self.services.as_ref(), &self.cfg.service.name)?;
        logging::backend(&format!(
            "restarted {} with profile {name} (exit {code})",
            self.cfg.service.name
        ));
        Ok(report)
    }

    /// Make `name` the active profile: merge it, remember the choice, restart
    /// the tunnel.
    ///
    /// A profile that fails to merge is not recorded and the previous active
    /// configuration stays in place.
    pub fn select(&self, name: &str) -> Result<MergeReport> {
        if !self.store.contains(name) {
            return Err(TunupError::NotFound(format!("profile `{name}`")).into());
        }
        let report = self.merger.apply(&self.store, name)?;

        let mut st = self.settings()?;
        st.profile = Some(name.to_string());
        settings::save(&self.cfg.paths.settings_file, &st)?;

        let code = self.services.restart(&self.cfg.service.name);
        if code != 0 {
            warn!("restart {} returned {code}", self.cfg.service.name);
        }
        info!("selected profile {name}");
        Ok(report)
    }

    pub fn refresh(&self, name: &str, now: u64) -> Result<RefreshOutcome> {
        let acquired = acquire::refresh(&self.store, self.fetcher.as_ref(), name, now)?;
        let merged = if self.selected()?.as_deref() == Some(name) {
            Some(self.activate(name)?)
        } else {
            None
        };
        Ok(RefreshOutcome { acquired, merged })
    }

    /// Refresh every due profile; re-merge when the selected one changed.
    pub fn refresh_due(&self, now: u64) -> Result<RefreshRun> {
        let run = scheduler::refresh_due(&self.store, self.fetcher.as_ref(), now)?;
        if let Some(sel) = self.selected()? {
            let changed = run.refreshed.iter().any(|a| a.name == sel && a.changed);
            if changed {
                if let Err(e) = self.activate(&sel) {
                    warn!("re-merge of {sel} after refresh failed: {e}");
                }
            }
        }
        Ok(run)
    }

    pub fn start_server(&mut self) -> TunupResult<StartOutcome> {
        self.store.ensure_dir()?;
        self.supervisor.start()
    }

    pub fn stop_server(&mut self) -> TunupResult<StopOutcome> {
        self.supervisor.stop()
    }

    /// Start the server, reclaiming the port first if a stale instance holds it.
    pub fn ensure_server(&mut self) -> TunupResult<StartOutcome> {
        match self.start_server() {
            Err(TunupError::PortInUse(port)) => {
                warn!("port {port} is held by a stale server; reclaiming");
                self.stop_server()?;
                self.start_server()
            }
            other => other,
        }
    }

    pub fn status(&mut self) -> Result<HostStatus> {
        let pid = self.supervisor.running_pid();
        Ok(HostStatus {
            selected: self.selected()?,
            profiles: self.store.list_profiles()?.len(),
            config_path: self.merger.config_path().to_path_buf(),
            server: ServerStatus {
                running: pid.is_some(),
                pid,
                addr: self.supervisor.addr().to_string(),
            },
            service: self.services.status(&self.cfg.service.name),
        })
    }

    /// Deploy the tunnel: assets into the runtime directory, the selected
    /// profile merged, the unit installed and enabled, the conflicting
    /// resolver turned off.
    pub fn install(&self) -> Result<MergeReport> {
        let Some(profile) = self.selected()? else {
            bail!("no profile selected; select one before installing");
        };
        let paths = &self.cfg.paths;
        let svc = &self.cfg.service;
        let unit = format!("{}.service", svc.name);

        fs::create_dir_all(&paths.config_dir)
            .with_context(|| format!("mkdir {}", paths.config_dir.display()))?;

        let binary = paths.config_dir.join(ASSET_BINARY);
        copy_file(&paths.assets_dir.join(ASSET_BINARY), &binary)?;
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", binary.display()))?;
        copy_file(&paths.assets_dir.join(&unit), &paths.config_dir.join(&unit))?;

        let geoip = paths.assets_dir.join(ASSET_GEOIP);
        if geoip.is_file() {
            copy_file(&geoip, &paths.config_dir.join(ASSET_GEOIP))?;
        } else {
            warn!("{} not shipped; skipping", geoip.display());
        }
        let web = paths.assets_dir.join(ASSET_WEB_DIR);
        if web.is_dir() {
            copy_tree(&web, &paths.config_dir.join(ASSET_WEB_DIR))?;
        }

        let report = self.merger.apply(&self.store, &profile)?;

        fs::create_dir_all(&svc.unit_dir)
            .with_context(|| format!("mkdir {}", svc.unit_dir.display()))?;
        copy_file(&paths.config_dir.join(&unit), &svc.unit_dir.join(&unit))?;

        let steps = [
            ("daemon-reload", self.services.daemon_reload()),
            ("enable", self.services.enable(&svc.name)),
            ("disable resolver", self.services.disable(&svc.resolver)),
            ("stop resolver", self.services.stop(&svc.resolver)),
            ("restart", self.services.restart(&svc.name)),
        ];
        for (step, code) in steps {
            if code != 0 {
                warn!("install step `{step}` exited with {code}");
            }
        }
        info!("installed {} with profile {profile}", svc.name);
        Ok(report)
    }

    pub fn uninstall(&self) -> Result<()> {
        let name = &self.cfg.service.name;
        let stop = self.services.stop(name);
        let disable = self.services.disable(name);
        if stop != 0 || disable != 0 {
            warn!("uninstall {name}: stop={stop} disable={disable}");
        }
        info!("uninstalled {name}");
        Ok(())
    }

    /// Best-effort cleanup when the host goes away.
    pub fn shutdown(&mut self) {
        match self.stop_server() {
            Ok(outcome) => logging::backend(&format!("shutdown: {outcome:?}")),
            Err(e) => warn!("shutdown: stopping profile server failed: {e}"),
        }
    }
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
    Ok(())
}

/// Recursive copy; existing files in `dst` are overwritten.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("mkdir {}", dst.display()))?;
    for ent in fs::read_dir(src).with_context(|| format!("readdir {}", src.display()))? {
        let ent = ent?;
        let from = ent.path();
        let to = dst.join(ent.file_name());
        if ent.file_type()?.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            copy_file(&from, &to)?;
        }
    }
    Ok(())
}
