//! Profile acquisition: the download and upload primitives shared by the
//! profile server and the refresh scheduler.
//!
//! A download always lands in a staging file first. Only a complete document
//! carrying every merged section replaces `<name>.yml`, and metadata is rewritten only after that
//! replacement, so a failed fetch never leaves a partial profile behind and
//! never touches an existing one.

use log::{info, warn};
use sha2::{Digest, Sha256};
use std::{fs, path::Path};

use crate::{
    error::{TunupError, TunupResult},
    fetch::{validate_url, Fetcher},
    merge::missing_section,
    store::{validate_profile_name, ProfileKind, ProfileMeta, ProfileStore, PROFILE_EXT},
};

#[derive(Debug, Clone)]
pub struct Acquired {
    pub name: String,
    pub bytes: u64,
    pub meta: ProfileMeta,
    /// sha256 of the stored content.
    pub digest: String,
    /// False when a refresh fetched exactly what was already stored.
    pub changed: bool,
}

fn sha256_hex(data: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(data);
    hex::encode(h.finalize())
}

fn file_digest(path: &Path) -> Option<String> {
    fs::read(path).ok().map(|b| sha256_hex(&b))
}

/// Refuse to change how an existing profile was acquired.
fn ensure_kind(store: &ProfileStore, name: &str, wanted: ProfileKind) -> TunupResult<()> {
    match store.read_meta(name) {
        Ok(meta) if meta.kind() != wanted => Err(TunupError::WrongProfileKind {
            profile: name.to_string(),
            kind: meta.kind(),
        }),
        Ok(_) | Err(TunupError::NotFound(_)) => Ok(()),
        // Unreadable metadata is replaced by the new acquisition.
        Err(e) => {
            warn!("ignoring unreadable metadata for {name}: {e}");
            Ok(())
        }
    }
}

fn check_document(data: &[u8], url: &str, name: &str) -> TunupResult<()> {
    match serde_yaml::from_slice::<serde_yaml::Value>(data) {
        Ok(doc @ serde_yaml::Value::Mapping(_)) => match missing_section(&doc) {
            Some(section) => Err(TunupError::MalformedProfile {
                profile: name.to_string(),
                section,
            }),
            None => Ok(()),
        },
        Ok(_) => Err(TunupError::DownloadFailed(format!(
            "{url} did not return a YAML mapping"
        ))),
        Err(e) => Err(TunupError::DownloadFailed(format!(
            "{url} did not return valid YAML: {e}"
        ))),
    }
}

/// Fetch `url` into profile `name` and record download metadata.
pub fn download(
    store: &ProfileStore,
    fetcher: &dyn Fetcher,
    name: &str,
    url: &str,
    update_interval_secs: u64,
    now: u64,
) -> TunupResult<Acquired> {
    let name = validate_profile_name(name.trim())?;
    let url = validate_url(url)?;
    ensure_kind(store, name, ProfileKind::Download)?;
    store.ensure_dir()?;

    let staged = store.staging_path(name)?;
    let live = store.profile_path(name)?;
    let previous = file_digest(&live);

    let fetched = fetcher.fetch(url, &staged).and_then(|n| {
        let data = fs::read(&staged)
            .map_err(|e| TunupError::io(format!("read {}", staged.display()), e))?;
        if data.is_empty() {
            return Err(TunupError::DownloadFailed(format!("empty download: {url}")));
        }
        check_document(&data, url, name)?;
        Ok((n, sha256_hex(&data)))
    });
    let (bytes, digest) = match fetched {
        Ok(v) => v,
        Err(e) => {
            store.discard_staged(name);
            warn!("download {name} from {url} failed: {e}");
            return Err(e);
        }
    };

    if let Err(e) = store.commit_staged(name) {
        store.discard_staged(name);
        return Err(e);
    }
    let meta = ProfileMeta::download(url, update_interval_secs, now);
    store.write_meta(name, &meta)?;

    let changed = previous.as_deref() != Some(digest.as_str());
    info!("downloaded profile {name} ({bytes} bytes, changed={changed})");
    Ok(Acquired {
        name: name.to_string(),
        bytes,
        meta,
        digest,
        changed,
    })
}

/// Store an uploaded file as profile `name`. Only `*.yml` file names are accepted.
pub fn upload(
    store: &ProfileStore,
    name: &str,
    file_name: &str,
    data: &[u8],
    now: u64,
) -> TunupResult<Acquired> {
    let name = validate_profile_name(name.trim())?;
    if !file_name.ends_with(&format!(".{PROFILE_EXT}")) {
        return Err(TunupError::InvalidFileType);
    }
    ensure_kind(store, name, ProfileKind::Upload)?;
    store.ensure_dir()?;

    let previous = store.profile_path(name).ok().and_then(|p| file_digest(&p));
    store.write_profile(name, data)?;
    let meta = ProfileMeta::upload(now);
    store.write_meta(name, &meta)?;

    let digest = sha256_hex(data);
    let changed = previous.as_deref() != Some(digest.as_str());
    info!("uploaded profile {name} from {file_name} ({} bytes)", data.len());
    Ok(Acquired {
        name: name.to_string(),
        bytes: data.len() as u64,
        meta,
        digest,
        changed,
    })
}

/// Re-fetch a download profile from its recorded source.
///
/// Upload profiles are rejected without touching any file.
pub fn refresh(
    store: &ProfileStore,
    fetcher: &dyn Fetcher,
    name: &str,
    now: u64,
) -> TunupResult<Acquired> {
    let meta = store.read_meta(name)?;
    match meta {
        ProfileMeta::Upload { .. } => Err(TunupError::WrongProfileKind {
            profile: name.to_string(),
            kind: ProfileKind::Upload,
        }),
        ProfileMeta::Download {
            source_url,
            update_interval_secs,
            ..
        } => download(store, fetcher, name, &source_url, update_interval_secs, now),
    }
}
