use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use interop_runs_core::{format_day, QuerySignature};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::Date;

const CACHE_FILE_PREFIX: &str = "runs";
const SIGNATURE_DIGEST_CHARS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to serialize run cache: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write run cache {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Raw catalog records per day, keyed by `YYYY-MM-DD`. Values are the arrays
/// exactly as the catalog returned them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayCache {
    days: BTreeMap<String, Vec<Value>>,
}

impl DayCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, day: Date) -> bool {
        self.days.contains_key(&format_day(day))
    }

    #[must_use]
    pub fn get(&self, day: Date) -> Option<&[Value]> {
        self.days.get(&format_day(day)).map(Vec::as_slice)
    }

    /// Replace whatever is cached for `day`.
    pub fn set(&mut self, day: Date, records: Vec<Value>) {
        self.days.insert(format_day(day), records);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.days.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Cached days in ascending order with their record counts.
    pub fn day_counts(&self) -> impl Iterator<Item = (&str, usize)> {
        self.days.iter().map(|(day, records)| (day.as_str(), records.len()))
    }

    /// Read a cache file. A missing, unreadable, or malformed file yields an
    /// empty cache.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let body = match fs::read(path) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no run cache yet");
                return Self::new();
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "run cache unreadable, starting empty");
                return Self::new();
            }
        };

        match serde_json::from_slice::<Self>(&body) {
            Ok(cache) => {
                tracing::debug!(path = %path.display(), days = cache.len(), "loaded run cache");
                cache
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "run cache corrupt, starting empty");
                Self::new()
            }
        }
    }

    /// Overwrite `path` with the full mapping. Not atomic.
    ///
    /// # Errors
    /// Returns [`CacheError`] when serialization or the file write fails.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let body = serde_json::to_vec(self)?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|source| CacheError::Write { path: path.to_path_buf(), source })?;
        }
        fs::write(path, body).map_err(|source| CacheError::Write { path: path.to_path_buf(), source })
    }
}

/// Location of the cache file for one query signature.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RunCache {
    path: PathBuf,
}

impl RunCache {
    #[must_use]
    pub fn new(dir: &Path, signature: &QuerySignature) -> Self {
        Self { path: dir.join(cache_file_name(signature)) }
    }

    #[must_use]
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cache and start a session. The session writes the cache back
    /// when closed or dropped.
    #[must_use]
    pub fn open(&self) -> CacheSession {
        CacheSession { path: self.path.clone(), data: DayCache::load(&self.path), flushed: false }
    }
}

/// Cache file name for a query signature: the channel for readability and a
/// digest of the full signature so distinct query shapes never share a file.
#[must_use]
pub fn cache_file_name(signature: &QuerySignature) -> String {
    let digest = hex::encode(Sha256::digest(signature.to_string().as_bytes()));
    let channel = signature
        .channel
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect::<String>();
    format!("{CACHE_FILE_PREFIX}-{channel}-{}.json", &digest[..SIGNATURE_DIGEST_CHARS])
}

/// An open cache. Dereferences to the in-memory [`DayCache`].
#[derive(Debug)]
pub struct CacheSession {
    path: PathBuf,
    data: DayCache,
    flushed: bool,
}

impl CacheSession {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the cache back and end the session.
    ///
    /// # Errors
    /// Returns [`CacheError`] when the write fails.
    pub fn close(mut self) -> Result<(), CacheError> {
        self.flushed = true;
        self.data.save(&self.path)
    }
}

impl Deref for CacheSession {
    type Target = DayCache;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for CacheSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for CacheSession {
    fn drop(&mut self) {
        if self.flushed {
            return;
        }
        if let Err(err) = self.data.save(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to write run cache");
        }
    }
}
