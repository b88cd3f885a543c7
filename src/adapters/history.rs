//! Conversation history stores.
//!
//! Both stores keep the latest summary per conversation and every stored
//! [`ProcessResult`] with its trace.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::domain::models::ProcessResult;
use crate::domain::ports::{HistoryError, HistoryStore};

#[derive(Debug, Default)]
pub struct MemoryHistory {
    conversations: RwLock<HashMap<String, Vec<ProcessResult>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn results(&self, conversation_id: &str) -> Vec<ProcessResult> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn load_summary(&self, conversation_id: &str) -> Result<Option<String>, HistoryError> {
        Ok(self
            .conversations
            .read()
            .await
            .get(conversation_id)
            .and_then(|results| results.last())
            .map(ProcessResult::summary))
    }

    async fn store(&self, conversation_id: &str, result: &ProcessResult) -> Result<(), HistoryError> {
        self.conversations
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .push(result.clone());
        Ok(())
    }
}

/// On-disk record for one conversation.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConversationFile {
    summary: Option<String>,
    results: Vec<ProcessResult>,
}

/// One pretty-printed JSON file per conversation under a directory.
#[derive(Debug)]
pub struct JsonFileHistory {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonFileHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, conversation_id: &str) -> PathBuf {
        let name: String = conversation_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    async fn read_file(&self, path: &Path) -> Result<ConversationFile, HistoryError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ConversationFile::default()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistory {
    async fn load_summary(&self, conversation_id: &str) -> Result<Option<String>, HistoryError> {
        let _guard = self.lock.read().await;
        Ok(self.read_file(&self.path_for(conversation_id)).await?.summary)
    }

    async fn store(&self, conversation_id: &str, result: &ProcessResult) -> Result<(), HistoryError> {
        let _guard = self.lock.write().await;
        let path = self.path_for(conversation_id);
        let mut file = self.read_file(&path).await?;
        file.summary = Some(result.summary());
        file.results.push(result.clone());

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, serde_json::to_vec_pretty(&file)?).await?;
        tracing::debug!(conversation_id, path = %path.display(), results = file.results.len(), "stored result");
        Ok(())
    }
}
