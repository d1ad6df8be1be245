//! Incremental rebuild cache
//!
//! Remembers, per declared input path, the modification time seen after the
//! last successful run (and optionally a BLAKE3 digest of the contents).
//! A task whose inputs all match and whose outputs all exist, none older
//! than the newest input, is fresh and its actions are skipped.
//!
//! State lives in the tool-owned working directory:
//! - `timestamps.json`: input path -> RFC3339 timestamp
//! - `hashes.json`: input path -> BLAKE3 hex digest (only with `hash_inputs`)
//!
//! It is only written after a fully successful run.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{KilnError, Result};
use crate::graph::{IoDecl, TaskDef};

pub const TIMESTAMP_FILE: &str = "timestamps.json";
pub const HASH_FILE: &str = "hashes.json";

/// What the cache knows about one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub modified: DateTime<Utc>,
    pub hash: Option<String>,
}

/// Input state of one task, read before its actions run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: Vec<(String, CacheEntry)>,
}

/// Verdict for one task invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(String),
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

/// Persisted input -> timestamp (and digest) mapping
#[derive(Debug)]
pub struct IncrementalCache {
    /// Where the JSON files live
    dir: PathBuf,
    /// Declared paths are relative to this directory
    root: PathBuf,
    hashing: bool,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
}

impl IncrementalCache {
    /// An empty cache that will save into `dir`
    pub fn empty(dir: impl Into<PathBuf>, root: impl Into<PathBuf>, hashing: bool) -> Self {
        Self {
            dir: dir.into(),
            root: root.into(),
            hashing,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load the cache; unreadable state is logged and replaced by an empty cache
    pub fn load(dir: impl Into<PathBuf>, root: impl Into<PathBuf>, hashing: bool) -> Self {
        let dir = dir.into();
        let root = root.into();
        match Self::try_load(&dir, &root, hashing) {
            Ok(cache) => cache,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable incremental cache");
                Self::empty(dir, root, hashing)
            }
        }
    }

    /// Load the cache, reporting unreadable or corrupt state. Missing files
    /// are an empty cache.
    pub fn try_load(dir: &Path, root: &Path, hashing: bool) -> Result<Self> {
        let cache = Self::empty(dir, root, hashing);

        let Some(timestamps) = read_map(&dir.join(TIMESTAMP_FILE))? else {
            return Ok(cache);
        };
        let hashes = if hashing {
            read_map(&dir.join(HASH_FILE))?.unwrap_or_default()
        } else {
            BTreeMap::new()
        };

        {
            let mut entries = cache.entries.lock();
            for (path, stamp) in timestamps {
                let modified = DateTime::parse_from_rfc3339(&stamp)
                    .map_err(|e| KilnError::cache(format!("bad timestamp for '{path}': {e}")))?
                    .with_timezone(&Utc);
                let hash = hashes.get(&path).cloned();
                entries.insert(path, CacheEntry { modified, hash });
            }
            debug!(entries = entries.len(), "loaded incremental cache");
        }

        Ok(cache)
    }

    /// Decide whether `task` can be skipped
    pub fn check(&self, task: &TaskDef) -> Result<Freshness> {
        if !task.is_tracked() {
            return Ok(Freshness::Stale("no declared inputs".to_string()));
        }

        let entries = self.entries.lock();
        let mut newest_input = None;
        for input in &task.inputs {
            let path = self.resolve(&input.path)?;
            let Some(modified) = modified_time(&path, input, task)? else {
                continue;
            };
            newest_input = newest_input.max(Some(modified));

            let Some(entry) = entries.get(&input.path) else {
                return Ok(Freshness::Stale(format!("input '{}' never observed", input.path)));
            };
            if entry.modified != modified {
                return Ok(Freshness::Stale(format!("input '{}' changed", input.path)));
            }

            if self.hashing || input.hash.is_some() {
                let digest = digest(&path)?;
                if self.hashing && entry.hash.as_deref() != Some(digest.as_str()) {
                    return Ok(Freshness::Stale(format!(
                        "input '{}' contents changed",
                        input.path
                    )));
                }
                if input.hash.as_deref().is_some_and(|expected| expected != digest) {
                    return Ok(Freshness::Stale(format!(
                        "input '{}' does not match its declared hash",
                        input.path
                    )));
                }
            }
        }

        for output in &task.outputs {
            let path = self.resolve(&output.path)?;
            let modified = match std::fs::metadata(&path) {
                Ok(meta) => DateTime::<Utc>::from(meta.modified()?),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if output.optional {
                        continue;
                    }
                    return Ok(Freshness::Stale(format!("output '{}' is missing", output.path)));
                }
                Err(e) => return Err(e.into()),
            };
            // another task sharing an input may have refreshed its entry
            if newest_input.is_some_and(|newest| modified < newest) {
                return Ok(Freshness::Stale(format!(
                    "output '{}' is older than its inputs",
                    output.path
                )));
            }
            if let Some(expected) = &output.hash {
                if digest(&path)? != *expected {
                    return Ok(Freshness::Stale(format!(
                        "output '{}' does not match its declared hash",
                        output.path
                    )));
                }
            }
        }

        Ok(Freshness::Fresh)
    }

    /// Read the current state of `task`'s inputs. Taken before the actions
    /// run so an input edited mid-build is seen as changed next time.
    pub fn snapshot(&self, task: &TaskDef) -> Result<Snapshot> {
        let mut entries = Vec::with_capacity(task.inputs.len());
        for input in &task.inputs {
            let path = self.resolve(&input.path)?;
            let Some(modified) = modified_time(&path, input, task)? else {
                continue;
            };
            let hash = if self.hashing {
                Some(digest(&path)?)
            } else {
                None
            };
            entries.push((input.path.clone(), CacheEntry { modified, hash }));
        }
        Ok(Snapshot { entries })
    }

    /// Store a snapshot once its task has succeeded
    pub fn commit(&self, task: &str, snapshot: Snapshot) {
        let mut entries = self.entries.lock();
        for (path, entry) in snapshot.entries {
            debug!(task, input = %path, "recorded input");
            entries.insert(path, entry);
        }
    }

    /// Write the cache to disk
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        ensure_gitignore(&self.dir)?;

        let entries = self.entries.lock();
        let timestamps: BTreeMap<&str, String> = entries
            .iter()
            .map(|(path, e)| {
                (
                    path.as_str(),
                    e.modified.to_rfc3339_opts(SecondsFormat::Nanos, true),
                )
            })
            .collect();
        write_json(&self.dir.join(TIMESTAMP_FILE), &timestamps)?;

        if self.hashing {
            let hashes: BTreeMap<&str, &str> = entries
                .iter()
                .filter_map(|(path, e)| e.hash.as_deref().map(|h| (path.as_str(), h)))
                .collect();
            write_json(&self.dir.join(HASH_FILE), &hashes)?;
        }

        debug!(entries = entries.len(), dir = %self.dir.display(), "saved incremental cache");
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<CacheEntry> {
        self.entries.lock().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Expand `~`/`$VAR` in a declared path and anchor it at the script root
    pub fn resolve(&self, declared: &str) -> Result<PathBuf> {
        let expanded = shellexpand::full(declared)
            .map_err(|e| KilnError::eval(format!("cannot expand path '{declared}': {e}")))?;
        Ok(self.root.join(expanded.as_ref()))
    }
}

/// Modification time of an input, `None` for a missing optional one
fn modified_time(path: &Path, decl: &IoDecl, task: &TaskDef) -> Result<Option<DateTime<Utc>>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.modified()?.into())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if decl.optional {
                Ok(None)
            } else {
                Err(KilnError::MissingInput {
                    task: task.name.clone(),
                    path: path.to_path_buf(),
                })
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn digest(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn read_map(path: &Path) -> Result<Option<BTreeMap<String, String>>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(KilnError::cache(format!(
                "cannot read {}: {e}",
                path.display()
            )))
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| KilnError::cache(format!("invalid {}: {e}", path.display())))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| KilnError::cache(format!("failed to serialize cache: {e}")))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn ensure_gitignore(dir: &Path) -> Result<()> {
    let path = dir.join(".gitignore");
    if !path.exists() {
        std::fs::write(path, "*\n")?;
    }
    Ok(())
}
