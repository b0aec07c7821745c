//! On-disk profile store.
//!
//! Each profile is a pair of files in one directory: `<name>.yml` holds the raw
//! document and `<name>.meta.yml` records how it was acquired. The directory is
//! the only persistent state; there is no index.

use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::BTreeSet,
    fmt,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use crate::error::{TunupError, TunupResult};

pub const PROFILE_EXT: &str = "yml";
const META_SUFFIX: &str = ".meta";
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Download,
    Upload,
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileKind::Download => write!(f, "download"),
            ProfileKind::Upload => write!(f, "upload"),
        }
    }
}

/// Acquisition metadata, stored as `<name>.meta.yml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProfileMeta {
    Download {
        #[serde(rename = "url")]
        source_url: String,
        #[serde(
            rename = "update_interval",
            default,
            deserialize_with = "lenient_seconds"
        )]
        update_interval_secs: u64,
        #[serde(rename = "update_time")]
        last_update: u64,
    },
    Upload {
        #[serde(rename = "update_time")]
        last_update: u64,
    },
}

impl ProfileMeta {
    pub fn download(url: &str, update_interval_secs: u64, now: u64) -> Self {
        ProfileMeta::Download {
            source_url: url.to_string(),
            update_interval_secs,
            last_update: now,
        }
    }

    pub fn upload(now: u64) -> Self {
        ProfileMeta::Upload { last_update: now }
    }

    pub fn kind(&self) -> ProfileKind {
        match self {
            ProfileMeta::Download { .. } => ProfileKind::Download,
            ProfileMeta::Upload { .. } => ProfileKind::Upload,
        }
    }

    pub fn last_update(&self) -> u64 {
        match self {
            ProfileMeta::Download { last_update, .. } | ProfileMeta::Upload { last_update } => {
                *last_update
            }
        }
    }

    /// Seconds between automatic refreshes; uploads never refresh.
    pub fn update_interval_secs(&self) -> u64 {
        match self {
            ProfileMeta::Download {
                update_interval_secs,
                ..
            } => *update_interval_secs,
            ProfileMeta::Upload { .. } => 0,
        }
    }

    pub fn source_url(&self) -> Option<&str> {
        match self {
            ProfileMeta::Download { source_url, .. } => Some(source_url),
            ProfileMeta::Upload { .. } => None,
        }
    }
}

// Older plugin builds wrote the form value verbatim, so the interval may be a
// number, a numeric string, or empty.
fn lenient_seconds<'de, D>(de: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_yaml::Value::deserialize(de)?;
    match v {
        serde_yaml::Value::Null => Ok(0),
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid update_interval {n}"))),
        serde_yaml::Value::String(s) if s.trim().is_empty() => Ok(0),
        serde_yaml::Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid update_interval {s:?}"))),
        other => Err(serde::de::Error::custom(format!(
            "invalid update_interval {other:?}"
        ))),
    }
}

pub fn is_valid_profile_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    if name.starts_with('.') || name.ends_with(META_SUFFIX) {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Reject anything that is not a plain file-name segment.
pub fn validate_profile_name(name: &str) -> TunupResult<&str> {
    if name.is_empty() {
        Err(TunupError::NameRequired)
    } else if is_valid_profile_name(name) {
        Ok(name)
    } else {
        Err(TunupError::InvalidName(name.to_string()))
    }
}

/// Write `data` next to `path` under a hidden temp name, flush it to disk, then
/// rename over `path`. Readers see either the old file or the new one.
pub fn write_atomic(path: &Path, data: &[u8]) -> TunupResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|e| TunupError::io(format!("mkdir {}", parent.display()), e))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.tmp"));

    let mut f = fs::File::create(&tmp)
        .map_err(|e| TunupError::io(format!("create {}", tmp.display()), e))?;
    f.write_all(data)
        .and_then(|_| f.sync_all())
        .map_err(|e| TunupError::io(format!("write {}", tmp.display()), e))?;
    drop(f);

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        TunupError::io(
            format!("rename {} -> {}", tmp.display(), path.display()),
            e,
        )
    })
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> TunupResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| TunupError::io(format!("mkdir {}", self.dir.display()), e))
    }

    pub fn profile_path(&self, name: &str) -> TunupResult<PathBuf> {
        let name = validate_profile_name(name)?;
        Ok(self.dir.join(format!("{name}.{PROFILE_EXT}")))
    }

    pub fn meta_path(&self, name: &str) -> TunupResult<PathBuf> {
        let name = validate_profile_name(name)?;
        Ok(self.dir.join(format!("{name}{META_SUFFIX}.{PROFILE_EXT}")))
    }

    /// Where a fetch lands before it is accepted. Never matches `*.yml`.
    pub fn staging_path(&self, name: &str) -> TunupResult<PathBuf> {
        let name = validate_profile_name(name)?;
        Ok(self.dir.join(format!(".{name}.{PROFILE_EXT}.part")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profile_path(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Profile names present in the directory. A profile with both files counts once.
    pub fn list_profiles(&self) -> TunupResult<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        let rd = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(TunupError::io(format!("readdir {}", self.dir.display()), e)),
        };
        for ent in rd.flatten() {
            let path = ent.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(PROFILE_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let name = stem.strip_suffix(META_SUFFIX).unwrap_or(stem);
            if name.is_empty() {
                continue;
            }
            out.insert(name.to_string());
        }
        debug!("profiles in {}: {}", self.dir.display(), out.len());
        Ok(out)
    }

    pub fn read_meta(&self, name: &str) -> TunupResult<ProfileMeta> {
        let path = self.meta_path(name)?;
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TunupError::NotFound(format!("metadata for profile `{name}`")))
            }
            Err(e) => return Err(TunupError::io(format!("read {}", path.display()), e)),
        };
        serde_yaml::from_str(&raw).map_err(|e| TunupError::parse(&path, e))
    }

    pub fn write_meta(&self, name: &str, meta: &ProfileMeta) -> TunupResult<()> {
        let path = self.meta_path(name)?;
        let text = serde_yaml::to_string(meta).map_err(|e| TunupError::parse(&path, e))?;
        write_atomic(&path, text.as_bytes())
    }

    pub fn read_profile(&self, name: &str) -> TunupResult<serde_yaml::Value> {
        let path = self.profile_path(name)?;
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TunupError::NotFound(format!("profile `{name}`")))
            }
            Err(e) => return Err(TunupError::io(format!("read {}", path.display()), e)),
        };
        serde_yaml::from_str(&raw).map_err(|e| TunupError::parse(&path, e))
    }

    pub fn write_profile(&self, name: &str, data: &[u8]) -> TunupResult<()> {
        let path = self.profile_path(name)?;
        write_atomic(&path, data)
    }

    /// Move a fully fetched staging file over the live profile.
    pub fn commit_staged(&self, name: &str) -> TunupResult<()> {
        let staged = self.staging_path(name)?;
        let live = self.profile_path(name)?;
        if let Ok(f) = fs::File::open(&staged) {
            let _ = f.sync_all();
        }
        fs::rename(&staged, &live).map_err(|e| {
            TunupError::io(
                format!("rename {} -> {}", staged.display(), live.display()),
                e,
            )
        })
    }

    pub fn discard_staged(&self, name: &str) {
        if let Ok(p) = self.staging_path(name) {
            let _ = fs::remove_file(p);
        }
    }
}
