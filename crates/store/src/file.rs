//! File-per-session store with optional zstd compression.
//!
//! Each session is one blob named by its ID: `{id}.json.zst` when
//! compressed, `{id}.json` otherwise. The loader also accepts `{id}.zst`
//! and a bare `{id}`, and sniffs the zstd frame magic instead of trusting
//! the extension. Writes go to a temporary file that is renamed over the
//! target, so readers never observe a partial blob.
//!
//! Storage location: `~/.parley/sessions/`

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parley_config::PersistenceConfig;
use parley_core::error::StoreError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::session::{SessionData, SessionMetadata, SessionStore, validate_session_id};

/// Extensions tried on load, in order.
const EXTENSIONS: &[&str] = &["json.zst", "json", "zst", ""];

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const ZSTD_LEVEL: i32 = 3;
const TMP_SUFFIX: &str = ".tmp";

/// A directory of session files.
pub struct FileSessionStore {
    dir: PathBuf,
    compress: bool,
    /// Zero means unlimited
    max_files: usize,
    /// Zero means unlimited
    max_age_days: u64,
}

impl FileSessionStore {
    /// Create a store rooted at `dir`. The directory is created on the
    /// first write.
    pub fn new(dir: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            dir: dir.into(),
            compress,
            max_files: 0,
            max_age_days: 0,
        }
    }

    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self::new(&config.directory, config.compress)
            .with_retention(config.max_files, config.max_age_days)
    }

    /// Builder: configure retention limits applied after every save.
    pub fn with_retention(mut self, max_files: usize, max_age_days: u64) -> Self {
        self.max_files = max_files;
        self.max_age_days = max_age_days;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Make sure the directory exists.
    pub async fn ensure_dir(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))
    }

    fn path_for(&self, session_id: &str, ext: &str) -> PathBuf {
        if ext.is_empty() {
            self.dir.join(session_id)
        } else {
            self.dir.join(format!("{session_id}.{ext}"))
        }
    }

    fn target_ext(&self) -> &'static str {
        if self.compress { "json.zst" } else { "json" }
    }

    fn encode(&self, data: &SessionData) -> Result<Vec<u8>, StoreError> {
        let encode_err = |reason: String| StoreError::Encode {
            session_id: data.session_id().to_string(),
            reason,
        };
        let json = serde_json::to_vec_pretty(data).map_err(|e| encode_err(e.to_string()))?;
        if self.compress {
            zstd::encode_all(json.as_slice(), ZSTD_LEVEL).map_err(|e| encode_err(e.to_string()))
        } else {
            Ok(json)
        }
    }

    fn decode(session_id: &str, bytes: &[u8]) -> Result<SessionData, StoreError> {
        let decode_err = |reason: String| StoreError::Decode {
            session_id: session_id.to_string(),
            reason,
        };
        let json = if bytes.starts_with(&ZSTD_MAGIC) {
            zstd::decode_all(bytes).map_err(|e| decode_err(e.to_string()))?
        } else {
            bytes.to_vec()
        };
        serde_json::from_slice(&json).map_err(|e| decode_err(e.to_string()))
    }

    /// The first existing file for `session_id`, in extension order.
    async fn find(&self, session_id: &str) -> Option<PathBuf> {
        for ext in EXTENSIONS {
            let path = self.path_for(session_id, ext);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }

    /// Every session file in the directory grouped by session ID, with the
    /// newest modification time of each group.
    async fn scan(&self) -> Result<HashMap<String, (Vec<PathBuf>, SystemTime)>, StoreError> {
        let mut groups: HashMap<String, (Vec<PathBuf>, SystemTime)> = HashMap::new();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(groups),
            Err(e) => return Err(io_error(&self.dir, e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&self.dir, e))? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.ends_with(TMP_SUFFIX) || file_name.starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let id = session_id_from_file_name(file_name);
            if validate_session_id(id).is_err() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let group = groups
                .entry(id.to_string())
                .or_insert_with(|| (Vec::new(), modified));
            group.0.push(path);
            group.1 = group.1.max(modified);
        }

        Ok(groups)
    }

    /// Remove sessions older than `max_age_days`, then the oldest beyond
    /// `max_files`. The session just saved is never removed.
    async fn prune(&self, keep: &str) -> Result<usize, StoreError> {
        if self.max_files == 0 && self.max_age_days == 0 {
            return Ok(0);
        }

        let mut groups: Vec<(String, Vec<PathBuf>, SystemTime)> = self
            .scan()
            .await?
            .into_iter()
            .map(|(id, (paths, modified))| (id, paths, modified))
            .collect();
        // Newest first
        groups.sort_by(|a, b| b.2.cmp(&a.2));

        let cutoff = (self.max_age_days > 0).then(|| {
            let age = Duration::days(self.max_age_days as i64);
            SystemTime::from(Utc::now() - age)
        });

        let mut removed = 0;
        let mut kept = 0;
        for (id, paths, modified) in groups {
            if id == keep {
                kept += 1;
                continue;
            }
            let too_old = cutoff.is_some_and(|c| modified < c);
            let too_many = self.max_files > 0 && kept >= self.max_files;
            if too_old || too_many {
                for path in &paths {
                    remove_if_exists(path).await?;
                }
                debug!(session_id = %id, too_old, too_many, "Pruned session");
                removed += 1;
            } else {
                kept += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Pruned old sessions");
        }
        Ok(removed)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, data: &SessionData) -> Result<(), StoreError> {
        let session_id = data.session_id();
        validate_session_id(session_id)?;
        self.ensure_dir().await?;

        let bytes = self.encode(data)?;
        let target = self.path_for(session_id, self.target_ext());
        let tmp = self
            .dir
            .join(format!("{session_id}.{}{TMP_SUFFIX}", self.target_ext()));

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| io_error(&target, e))?;

        for ext in EXTENSIONS {
            if *ext != self.target_ext() {
                remove_if_exists(&self.path_for(session_id, ext)).await?;
            }
        }

        info!(
            session_id,
            messages = data.messages.len(),
            summaries = data.summaries.len(),
            bytes = bytes.len(),
            path = %target.display(),
            "Session saved"
        );

        if let Err(e) = self.prune(session_id).await {
            warn!(error = %e, "Failed to prune old sessions");
        }
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionData>, StoreError> {
        validate_session_id(session_id)?;
        let Some(path) = self.find(session_id).await else {
            debug!(session_id, "No stored session");
            return Ok(None);
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };

        let data = Self::decode(session_id, &bytes)?;
        info!(
            session_id,
            messages = data.messages.len(),
            summaries = data.summaries.len(),
            "Session loaded"
        );
        Ok(Some(data))
    }

    async fn list(&self) -> Result<Vec<SessionMetadata>, StoreError> {
        let groups = self.scan().await?;
        let mut sessions = Vec::with_capacity(groups.len());

        for id in groups.keys() {
            match self.load(id).await {
                Ok(Some(data)) => sessions.push(data.metadata),
                Ok(None) => {}
                Err(e) => warn!(session_id = %id, error = %e, "Skipping unreadable session"),
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        validate_session_id(session_id)?;
        for ext in EXTENSIONS {
            remove_if_exists(&self.path_for(session_id, ext)).await?;
        }
        info!(session_id, "Session deleted");
        Ok(())
    }
}

/// Strip the longest known extension.
fn session_id_from_file_name(file_name: &str) -> &str {
    EXTENSIONS
        .iter()
        .filter(|ext| !ext.is_empty())
        .find_map(|ext| file_name.strip_suffix(format!(".{ext}").as_str()))
        .unwrap_or(file_name)
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path, e)),
    }
}

fn io_error(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}
