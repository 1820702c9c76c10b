//! Checkpoint creation, resume, and persistence.
//!
//! A checkpoint carries the trimmed context and the node to re-enter at.
//! History is trimmed to the compression strategy's keep-recent count and
//! the discarded prefix travels alongside as a summary artifact, so a
//! resumed node observes only the retained history.
//!
//! Stores are pluggable. The file store writes JSON, optionally zstd
//! compressed, with a temp-file-then-rename pattern so a crash never
//! leaves a torn checkpoint behind.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::budget::{CompressedContext, CompressionStrategy};
use crate::context::{Context, StepResult};
use crate::graph::engine::WorkflowGraph;
use crate::graph::error::GraphError;
use crate::llm::LanguageModel;

/// Resumable snapshot of graph execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub checkpoint_id: String,
    pub resume_node: String,
    pub context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed: Option<CompressedContext>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowGraph {
    /// Trim the context's history to the strategy's keep-recent count and
    /// capture a resumable snapshot at `node_id`.
    ///
    /// The discarded history prefix is summarized through `model` before
    /// anything is trimmed, so a failed summarization fails the checkpoint
    /// and leaves the context untouched. Callers should treat an error as
    /// "no checkpoint taken" and keep running.
    pub async fn create_checkpoint(
        &self,
        cancel: &CancellationToken,
        task_id: impl Into<String>,
        node_id: &str,
        context: &mut Context,
        model: &dyn LanguageModel,
        strategy: &CompressionStrategy,
    ) -> Result<Checkpoint, GraphError> {
        if !self.contains_node(node_id) {
            return Err(GraphError::UnknownNode(node_id.to_string()));
        }

        let compressed = strategy
            .compress_for_checkpoint(cancel, model, context)
            .await?;

        let checkpoint = Checkpoint {
            task_id: task_id.into(),
            checkpoint_id: Uuid::new_v4().to_string(),
            resume_node: node_id.to_string(),
            context: context.clone(),
            compressed,
            created_at: Utc::now(),
        };
        info!(
            task_id = %checkpoint.task_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            resume_node = %checkpoint.resume_node,
            history = checkpoint.context.history().len(),
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Re-enter execution at the checkpoint's recorded node with its
    /// already-trimmed context. Returns the terminal result and the final
    /// context.
    pub async fn resume_from_checkpoint(
        &self,
        cancel: &CancellationToken,
        checkpoint: Checkpoint,
    ) -> Result<(StepResult, Context), GraphError> {
        let mut context = checkpoint.context;
        let result = self
            .execute_from(cancel, &checkpoint.resume_node, &mut context)
            .await?;
        Ok((result, context))
    }
}

/// Persistence boundary for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), GraphError>;

    async fn load(
        &self,
        task_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, GraphError>;

    /// Most recently created checkpoint for a task.
    async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, GraphError>;

    /// Checkpoint ids for a task, oldest first.
    async fn list(&self, task_id: &str) -> Result<Vec<String>, GraphError>;

    /// Drop all but the `keep` most recent checkpoints. Returns how many
    /// were removed.
    async fn prune(&self, task_id: &str, keep: usize) -> Result<usize, GraphError>;
}

/// In-memory store for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    // task id -> checkpoints in creation order
    checkpoints: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), GraphError> {
        let mut map = self.checkpoints.write().await;
        map.entry(checkpoint.task_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn load(
        &self,
        task_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, GraphError> {
        let map = self.checkpoints.read().await;
        Ok(map.get(task_id).and_then(|list| {
            list.iter()
                .find(|c| c.checkpoint_id == checkpoint_id)
                .cloned()
        }))
    }

    async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, GraphError> {
        let map = self.checkpoints.read().await;
        Ok(map.get(task_id).and_then(|list| list.last().cloned()))
    }

    async fn list(&self, task_id: &str) -> Result<Vec<String>, GraphError> {
        let map = self.checkpoints.read().await;
        Ok(map
            .get(task_id)
            .map(|list| list.iter().map(|c| c.checkpoint_id.clone()).collect())
            .unwrap_or_default())
    }

    async fn prune(&self, task_id: &str, keep: usize) -> Result<usize, GraphError> {
        let mut map = self.checkpoints.write().await;
        let Some(list) = map.get_mut(task_id) else {
            return Ok(0);
        };
        let excess = list.len().saturating_sub(keep);
        list.drain(..excess);
        Ok(excess)
    }
}

/// File-backed store. One directory per task, one JSON file per
/// checkpoint, named so lexical order is creation order.
#[derive(Debug)]
pub struct FileCheckpointStore {
    base_path: PathBuf,
    compression: bool,
}

impl FileCheckpointStore {
    pub fn new(base_path: impl Into<PathBuf>, compression: bool) -> Self {
        Self {
            base_path: base_path.into(),
            compression,
        }
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.base_path.join(sanitize(task_id))
    }

    fn file_name(&self, checkpoint: &Checkpoint) -> String {
        let ext = if self.compression { "json.zst" } else { "json" };
        format!(
            "{:013}_{}.{}",
            checkpoint.created_at.timestamp_millis(),
            checkpoint.checkpoint_id,
            ext
        )
    }

    fn parse_id(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(".json.zst").or(name.strip_suffix(".json"))?;
        let (_, id) = stem.split_once('_')?;
        Some(id.to_string())
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>, GraphError> {
        let mut encoder = zstd::stream::Encoder::new(Vec::new(), 3)
            .map_err(|e| GraphError::checkpoint(format!("compression init failed: {}", e)))?;
        encoder
            .write_all(data)
            .map_err(|e| GraphError::checkpoint(format!("compression write failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| GraphError::checkpoint(format!("compression finish failed: {}", e)))
    }

    fn decompress(data: &[u8]) -> Result<Vec<u8>, GraphError> {
        zstd::stream::decode_all(data)
            .map_err(|e| GraphError::checkpoint(format!("decompression failed: {}", e)))
    }

    /// Checkpoint files in a task dir, oldest first.
    async fn sorted_files(&self, task_id: &str) -> Result<Vec<PathBuf>, GraphError> {
        let dir = self.task_dir(task_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| GraphError::checkpoint(format!("failed to read directory: {}", e)))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GraphError::checkpoint(format!("failed to read entry: {}", e)))?
        {
            let path = entry.path();
            if Self::parse_id(&path).is_some() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_checkpoint(&self, path: &Path) -> Result<Checkpoint, GraphError> {
        let mut file = fs::File::open(path)
            .await
            .map_err(|e| GraphError::checkpoint(format!("failed to open file: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| GraphError::checkpoint(format!("failed to read file: {}", e)))?;

        let json = if path.extension().is_some_and(|ext| ext == "zst") {
            Self::decompress(&data)?
        } else {
            data
        };
        serde_json::from_slice(&json)
            .map_err(|e| GraphError::checkpoint(format!("deserialization failed: {}", e)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), GraphError> {
        let dir = self.task_dir(&checkpoint.task_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| GraphError::checkpoint(format!("failed to create directory: {}", e)))?;

        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| GraphError::checkpoint(format!("serialization failed: {}", e)))?;
        let data = if self.compression {
            Self::compress(&json)?
        } else {
            json
        };

        let final_path = dir.join(self.file_name(checkpoint));
        let temp_path = dir.join(format!("{}.tmp", checkpoint.checkpoint_id));

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| GraphError::checkpoint(format!("failed to create temp file: {}", e)))?;
        file.write_all(&data)
            .await
            .map_err(|e| GraphError::checkpoint(format!("failed to write data: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| GraphError::checkpoint(format!("failed to sync file: {}", e)))?;
        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| GraphError::checkpoint(format!("failed to rename file: {}", e)))?;

        debug!(path = %final_path.display(), "checkpoint written");
        Ok(())
    }

    async fn load(
        &self,
        task_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, GraphError> {
        for path in self.sorted_files(task_id).await? {
            if Self::parse_id(&path).as_deref() == Some(checkpoint_id) {
                return Ok(Some(self.read_checkpoint(&path).await?));
            }
        }
        Ok(None)
    }

    async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, GraphError> {
        match self.sorted_files(task_id).await?.last() {
            Some(path) => Ok(Some(self.read_checkpoint(path).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self, task_id: &str) -> Result<Vec<String>, GraphError> {
        Ok(self
            .sorted_files(task_id)
            .await?
            .iter()
            .filter_map(|path| Self::parse_id(path))
            .collect())
    }

    async fn prune(&self, task_id: &str, keep: usize) -> Result<usize, GraphError> {
        let files = self.sorted_files(task_id).await?;
        let excess = files.len().saturating_sub(keep);
        for path in &files[..excess] {
            fs::remove_file(path)
                .await
                .map_err(|e| GraphError::checkpoint(format!("failed to remove file: {}", e)))?;
        }
        Ok(excess)
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
