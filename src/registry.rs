//! Local file cache of the NAAN registry.
//!
//! The registry is a JSON document listing, for every Name Assigning Authority (and shoulder),
//! where its ARKs resolve to. Each download is kept as a timestamped `data_*.json` file; the
//! newest one is reused while it is younger than the refresh interval, and serves as a stale
//! fallback when the network is unavailable.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

pub const DEFAULT_REGISTRY_URL: &str = "https://cdluc3.github.io/naan_reg_priv/naan_records.json";

// The registry is a few MiB; ureq's default body limit is too tight for it to grow.
const MAX_REGISTRY_BYTES: u64 = 64 * 1024 * 1024;

/// Registry snapshots kept on disk; older ones are deleted after each download.
pub const KEEP_CACHE_FILES: usize = 5;

/// Where an ARK (or ARK shoulder) is redirected to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Target {
    /// Redirect URL, usually ending in a `${content}` placeholder.
    pub url: String,
    #[serde(default = "default_http_code")]
    pub http_code: u16,
}

fn default_http_code() -> u16 {
    302
}

/// One entry of the registry's `data` array. Only the fields needed for resolution are kept.
#[derive(Clone, Debug, Deserialize)]
pub struct NaanRecord {
    /// NAAN, optionally followed by `/shoulder`.
    pub what: String,
    pub target: Target,
}

/// A registry document as published, together with its parsed records.
#[derive(Clone, Debug)]
pub struct RegistryDocument {
    raw: Value,
    records: Vec<NaanRecord>,
}

impl RegistryDocument {
    pub fn from_value(raw: Value) -> anyhow::Result<Self> {
        let data = raw
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("NAAN registry document has no `data` array"))?;

        let mut records = Vec::with_capacity(data.len());
        for entry in data {
            match NaanRecord::deserialize(entry) {
                Ok(record) => records.push(record),
                // Records without a resolvable target (e.g. withdrawn NAANs) are expected.
                Err(e) => debug!(error = %e, what = ?entry.get("what"), "Skipping registry record"),
            }
        }

        Ok(RegistryDocument { raw, records })
    }

    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let raw: Value = serde_json::from_str(s).context("NAAN registry is not valid JSON")?;
        Self::from_value(raw)
    }

    /// The document exactly as it was downloaded.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn records(&self) -> &[NaanRecord] {
        &self.records
    }
}

/// How [`ensure_up_to_date`] obtained the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    FileCache,
    Download,
    StaleFileCache,
}

#[derive(Debug)]
pub struct Loaded {
    pub document: RegistryDocument,
    pub source: Source,
    /// Cache file the document was read from or written to, if any.
    pub file: Option<PathBuf>,
}

/// Knobs controlling where the registry comes from and how long a copy stays valid.
#[derive(Clone, Debug)]
pub struct RegistrySettings {
    pub url: String,
    pub cache_dir: PathBuf,
    pub max_age: Duration,
    pub force_download: bool,
    /// Upper bound on a whole download, connect to last body byte.
    pub timeout: Duration,
}

/// Directory of `data_<timestamp>.json` registry snapshots.
#[derive(Clone, Debug)]
pub struct RegistryCache {
    dir: PathBuf,
}

impl RegistryCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RegistryCache { dir: dir.into() }
    }

    /// Cache files, newest first.
    fn files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("data_") && name.ends_with(".json")
            })
            .filter_map(|e| {
                let mtime = e.metadata().and_then(|m| m.modified()).ok()?;
                Some((mtime, e.path()))
            })
            .collect();
        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        files.into_iter().map(|(_, path)| path).collect()
    }

    /// Most recently modified cache file, if the directory holds any.
    pub fn latest_file(&self) -> Option<PathBuf> {
        self.files().into_iter().next()
    }

    /// Delete all but the `keep` newest cache files, returning how many were removed.
    pub fn prune(&self, keep: usize) -> usize {
        let mut removed = 0;
        for file in self.files().into_iter().skip(keep) {
            match fs::remove_file(&file) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %file.display(), error = %e, "Could not remove old registry cache"),
            }
        }
        removed
    }

    pub fn load(&self, file: &Path) -> anyhow::Result<RegistryDocument> {
        let s = fs::read_to_string(file)
            .with_context(|| format!("failed to read registry cache {}", file.display()))?;
        RegistryDocument::from_json(&s)
            .with_context(|| format!("corrupt registry cache {}", file.display()))
    }

    pub fn save(&self, document: &RegistryDocument) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create cache dir {}", self.dir.display()))?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let file = self.dir.join(format!("data_{stamp}.json"));
        let body = serde_json::to_string_pretty(document.raw())?;
        fs::write(&file, body)
            .with_context(|| format!("failed to write registry cache {}", file.display()))?;
        Ok(file)
    }
}

/// Whether `file` was written less than `max_age` ago.
pub fn is_fresh(file: &Path, max_age: Duration) -> bool {
    let Ok(mtime) = fs::metadata(file).and_then(|m| m.modified()) else {
        return false;
    };
    match SystemTime::now().duration_since(mtime) {
        Ok(age) => age < max_age,
        // Modified "in the future": clock skew, count it as just written.
        Err(_) => true,
    }
}

pub fn download(url: &str, timeout: Duration) -> anyhow::Result<RegistryDocument> {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    let agent = ureq::Agent::new_with_config(config);
    let body = agent
        .get(url)
        .header("Accept", "application/json")
        .call()
        .with_context(|| format!("failed to download NAAN registry from {url}"))?
        .body_mut()
        .with_config()
        .limit(MAX_REGISTRY_BYTES)
        .read_to_string()
        .with_context(|| format!("failed to read NAAN registry body from {url}"))?;
    RegistryDocument::from_json(&body)
}

/// Load the registry from the cache when it is fresh, otherwise download it.
///
/// A failed refresh falls back to the newest cached copy regardless of its age; the error is only
/// returned when there is nothing cached at all.
pub fn ensure_up_to_date(settings: &RegistrySettings) -> anyhow::Result<Loaded> {
    let cache = RegistryCache::new(&settings.cache_dir);
    let latest = cache.latest_file();

    match refresh(&cache, latest.as_deref(), settings) {
        Ok(loaded) => Ok(loaded),
        Err(err) => {
            error!(error = %format!("{err:#}"), "Error updating NAAN registry cache");
            let Some(file) = latest else {
                return Err(err);
            };
            let document = cache
                .load(&file)
                .with_context(|| format!("no usable NAAN registry ({err:#})"))?;
            warn!(file = %file.display(), "Falling back to stale NAAN registry file cache");
            Ok(Loaded {
                document,
                source: Source::StaleFileCache,
                file: Some(file),
            })
        }
    }
}

fn refresh(
    cache: &RegistryCache,
    latest: Option<&Path>,
    settings: &RegistrySettings,
) -> anyhow::Result<Loaded> {
    if !settings.force_download
        && let Some(file) = latest
        && is_fresh(file, settings.max_age)
    {
        let document = cache.load(file)?;
        info!(file = %file.display(), "Loaded NAAN registry from file cache");
        return Ok(Loaded {
            document,
            source: Source::FileCache,
            file: Some(file.to_path_buf()),
        });
    }

    let document = download(&settings.url, settings.timeout)?;
    let file = match cache.save(&document) {
        Ok(file) => {
            info!(file = %file.display(), "Downloaded NAAN registry and saved to file cache");
            let removed = cache.prune(KEEP_CACHE_FILES);
            if removed > 0 {
                debug!(removed, "Pruned old NAAN registry cache files");
            }
            Some(file)
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Downloaded NAAN registry but could not cache it");
            None
        }
    };
    Ok(Loaded {
        document,
        source: Source::Download,
        file,
    })
}
