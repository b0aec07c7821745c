//! Builds the active configuration from the template and one profile.

use log::{info, warn};
use serde_yaml::{Mapping, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    error::{TunupError, TunupResult},
    service::ServiceControl,
    store::{write_atomic, ProfileStore},
};

/// Sections taken from the profile; everything else comes from the template.
pub const OVERLAY_KEYS: [&str; 3] = ["proxies", "proxy-groups", "rules"];

const PREVIEW_PROXIES: usize = 3;

/// First overlay section that `profile` lacks or leaves empty.
pub fn missing_section(profile: &Value) -> Option<&'static str> {
    OVERLAY_KEYS
        .into_iter()
        .find(|key| profile.get(*key).map_or(true, Value::is_null))
}

/// Overlay the profile's proxy sections onto a copy of the template.
///
/// Keys keep their template position so repeated merges serialize identically.
pub fn merge(template: &Mapping, profile: &Value, profile_name: &str) -> TunupResult<Mapping> {
    if let Some(section) = missing_section(profile) {
        return Err(TunupError::MalformedProfile {
            profile: profile_name.to_string(),
            section,
        });
    }
    let mut out = template.clone();
    for key in OVERLAY_KEYS {
        if let Some(section) = profile.get(key) {
            out.insert(Value::String(key.to_string()), section.clone());
        }
    }
    Ok(out)
}

pub fn load_template(path: &Path) -> TunupResult<Mapping> {
    let raw = fs::read_to_string(path)
        .map_err(|e| TunupError::io(format!("read template {}", path.display()), e))?;
    match serde_yaml::from_str::<Value>(&raw).map_err(|e| TunupError::parse(path, e))? {
        Value::Mapping(m) => Ok(m),
        Value::Null => Ok(Mapping::new()),
        _ => Err(TunupError::parse(path, "template must be a mapping")),
    }
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub profile: String,
    pub config_path: PathBuf,
    pub proxies: usize,
    pub proxy_groups: usize,
    pub rules: usize,
    /// Names of the first few proxies, for the UI log.
    pub preview: Vec<String>,
}

fn seq_len(m: &Mapping, key: &str) -> usize {
    m.get(key).and_then(Value::as_sequence).map_or(0, Vec::len)
}

fn proxy_preview(m: &Mapping) -> Vec<String> {
    m.get("proxies")
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .take(PREVIEW_PROXIES)
                .filter_map(|p| p.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct ConfigMerger {
    template_path: PathBuf,
    config_path: PathBuf,
}

impl ConfigMerger {
    pub fn new(template_path: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            template_path: template_path.into(),
            config_path: config_path.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Merge `name` into the active configuration file.
    ///
    /// Nothing is written unless the merge succeeds, so a bad profile leaves the
    /// previous configuration in place.
    pub fn apply(&self, store: &ProfileStore, name: &str) -> TunupResult<MergeReport> {
        let template = load_template(&self.template_path)?;
        let profile = store.read_profile(name)?;
        let merged = merge(&template, &profile, name)?;

        let text = serde_yaml::to_string(&merged)
            .map_err(|e| TunupError::parse(&self.config_path, e))?;
        write_atomic(&self.config_path, text.as_bytes())?;

        let report = MergeReport {
            profile: name.to_string(),
            config_path: self.config_path.clone(),
            proxies: seq_len(&merged, "proxies"),
            proxy_groups: seq_len(&merged, "proxy-groups"),
            rules: seq_len(&merged, "rules"),
            preview: proxy_preview(&merged),
        };
        info!(
            "merged profile {} -> {} (proxies={} groups={} rules={})",
            name,
            self.config_path.display(),
            report.proxies,
            report.proxy_groups,
            report.rules
        );
        Ok(report)
    }

    /// Merge, then restart the tunnel service so it picks up the new file.
    pub fn activate(
        &self,
        store: &ProfileStore,
        name: &str,
        services: &dyn ServiceControl,
        service_name: &str,
    ) -> TunupResult<(MergeReport, i32)> {
        let report = self.apply(store, name)?;
        let code = services.restart(service_name);
        if code != 0 {
            warn!("restart {service_name} returned {code}");
        }
        Ok((report, code))
    }
}
