use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::runner::queue::SeedTask;

const INDEX_FILE: &str = "bug_index.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BugArtifact {
    /// Where the fuzzer wrote it.
    pub source_path: PathBuf,
    /// Where it lives now, under the bugs root.
    pub stored_path: PathBuf,
    pub content_hash: String,
    pub seed: PathBuf,
    pub solver_name: String,
    pub oracle_name: String,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BugIndex {
    artifacts: BTreeMap<String, BugArtifact>,
}

/// Moves bug artifacts out of per-worker output directories into the bugs
/// root, keeping a content-addressed index so the same input is never
/// recorded twice, across workers or across runs.
pub struct BugCollector {
    root: PathBuf,
    index_path: PathBuf,
    patterns: Vec<glob::Pattern>,
    index: Mutex<BTreeMap<String, BugArtifact>>,
}

impl BugCollector {
    pub async fn load(root: PathBuf, patterns: &[String]) -> Result<Self> {
        if fs::metadata(&root).await.is_err() {
            fs::create_dir_all(&root)
                .await
                .with_context(|| format!("failed to create bugs directory {:?}", root))?;
        }

        let patterns = patterns
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern)
                    .with_context(|| format!("invalid bug pattern {:?}", pattern))
            })
            .collect::<Result<Vec<_>>>()?;

        let index_path = root.join(INDEX_FILE);
        let artifacts = if fs::metadata(&index_path).await.is_ok() {
            let blob = fs::read(&index_path)
                .await
                .with_context(|| format!("failed to read bug index {:?}", index_path))?;
            if blob.is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_slice::<BugIndex>(&blob)
                    .with_context(|| "failed to deserialize bug index".to_string())?
                    .artifacts
            }
        } else {
            BTreeMap::new()
        };
        debug!(known = artifacts.len(), "loaded bug index");

        Ok(Self {
            root,
            index_path,
            patterns,
            index: Mutex::new(artifacts),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.is_empty()
    }

    pub async fn contains(&self, fingerprint: &str) -> bool {
        self.index.lock().await.contains_key(fingerprint)
    }

    pub async fn artifacts(&self) -> Vec<BugArtifact> {
        self.index.lock().await.values().cloned().collect()
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.patterns.iter().any(|pattern| pattern.matches(name)))
    }

    /// Files in `dir` that look like bug artifacts, sorted by name.
    pub async fn candidates(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        if fs::metadata(dir).await.is_err() {
            return Ok(found);
        }
        let mut entries = fs::read_dir(dir)
            .await
            .with_context(|| format!("failed to list {:?}", dir))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) && self.matches(&path) {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Harvest `dir`, which belongs to the worker that just ran `task`.
    ///
    /// Files whose content is already indexed are deleted from `dir`; new
    /// ones are moved to the bugs root and indexed. Stored artifacts are
    /// never touched, so `dir` may be the bugs root itself. A file that
    /// cannot be read or moved is skipped with a warning.
    pub async fn collect(&self, dir: &Path, task: &SeedTask) -> Result<Vec<BugArtifact>> {
        let mut collected = Vec::new();
        for source in self.candidates(dir).await? {
            match self.collect_one(&source, task).await {
                Ok(Some(artifact)) => collected.push(artifact),
                Ok(None) => {}
                Err(err) => warn!("failed to collect bug file {:?}: {:#}", source, err),
            }
        }
        if !collected.is_empty() {
            info!(
                seed = %task.path.display(),
                count = collected.len(),
                "persisted new bug artifacts"
            );
        }
        Ok(collected)
    }

    async fn collect_one(&self, source: &Path, task: &SeedTask) -> Result<Option<BugArtifact>> {
        let content = fs::read(source)
            .await
            .with_context(|| format!("failed to read {:?}", source))?;
        let fingerprint = fingerprint(&content);

        let mut index = self.index.lock().await;
        if index.values().any(|known| known.stored_path == source) {
            return Ok(None);
        }
        if index.contains_key(&fingerprint) {
            debug!(fingerprint = %fingerprint, path = ?source, "duplicate bug artifact");
            fs::remove_file(source)
                .await
                .with_context(|| format!("failed to remove duplicate {:?}", source))?;
            return Ok(None);
        }

        let stored_path = if source.parent() == Some(self.root.as_path()) {
            source.to_path_buf()
        } else {
            let stored_path = self.destination(source, &fingerprint).await;
            move_file(source, &stored_path).await?;
            stored_path
        };

        let artifact = BugArtifact {
            source_path: source.to_path_buf(),
            stored_path,
            content_hash: fingerprint.clone(),
            seed: task.path.clone(),
            solver_name: task.solver_name.clone(),
            oracle_name: task.oracle_name.clone(),
            discovered_at: Utc::now(),
        };
        index.insert(fingerprint, artifact.clone());
        // the file is already in place; the next persist or flush catches up
        if let Err(err) = persist(&self.index_path, &index).await {
            warn!("failed to persist bug index: {:#}", err);
        }
        Ok(Some(artifact))
    }

    /// `<root>/<name>`, or a timestamped variant if that is taken.
    async fn destination(&self, source: &Path, fingerprint: &str) -> PathBuf {
        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{fingerprint}.smt2"));
        let direct = self.root.join(&name);
        if fs::metadata(&direct).await.is_err() {
            return direct;
        }
        let stem = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| fingerprint.to_string());
        let ext = source
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let stamped = self
            .root
            .join(format!("{stem}_{}{ext}", Utc::now().timestamp_millis()));
        if fs::metadata(&stamped).await.is_err() {
            return stamped;
        }
        self.root.join(format!("{stem}_{}{ext}", &fingerprint[..12]))
    }

    /// Write the index to disk.
    pub async fn flush(&self) -> Result<()> {
        let index = self.index.lock().await;
        persist(&self.index_path, &index).await
    }
}

/// MD5 of the artifact bytes, hex encoded.
pub fn fingerprint(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // rename fails across filesystems
    fs::copy(from, to)
        .await
        .with_context(|| format!("failed to copy {:?} to {:?}", from, to))?;
    fs::remove_file(from)
        .await
        .with_context(|| format!("failed to remove {:?} after copy", from))?;
    Ok(())
}

async fn persist(path: &Path, artifacts: &BTreeMap<String, BugArtifact>) -> Result<()> {
    let data = BugIndex {
        artifacts: artifacts.clone(),
    };
    let blob = serde_json::to_vec_pretty(&data)
        .with_context(|| "failed to serialize bug index".to_string())?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, blob)
        .await
        .with_context(|| format!("failed to write temp index {:?}", temp_path))?;
    fs::rename(&temp_path, path)
        .await
        .with_context(|| "failed to atomically update bug index".to_string())?;
    Ok(())
}
