use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::store::write_atomic;

/// Host-side key/value settings the backend cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Profile merged into the active configuration.
    #[serde(default)]
    pub profile: Option<String>,
}

impl Settings {
    pub fn selected(&self) -> Option<&str> {
        self.profile.as_deref().filter(|p| !p.is_empty())
    }
}

pub fn load(path: &Path) -> Result<Settings> {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    if raw.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

pub fn save(path: &Path, st: &Settings) -> Result<()> {
    let s = serde_json::to_string_pretty(st)?;
    write_atomic(path, s.as_bytes()).with_context(|| format!("write {}", path.display()))
}
