//! Read-only access to agents on disk
//!
//! Layout: `<root>/<agent_id>/profile.json` and `<root>/<agent_id>/system_prompt.md`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use super::profile::AgentProfile;

const PROFILE_FILE: &str = "profile.json";
const SYSTEM_PROMPT_FILE: &str = "system_prompt.md";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent '{0}' not found")]
    NotFound(String),
    #[error("invalid agent id '{0}'")]
    InvalidId(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Lookup of agent profiles and their system prompts
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// All readable agents, ordered by id
    async fn list_agents(&self) -> Result<Vec<AgentProfile>, AgentError>;

    async fn get_agent(&self, agent_id: &str) -> Result<AgentProfile, AgentError>;

    /// The agent's system prompt; `None` when the agent has none
    async fn system_prompt(&self, agent_id: &str) -> Result<Option<String>, AgentError>;
}

/// Agent directory backed by the filesystem
#[derive(Debug, Clone)]
pub struct FileAgentDirectory {
    root: PathBuf,
}

impl FileAgentDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn agent_dir(&self, agent_id: &str) -> Result<PathBuf, AgentError> {
        let valid = !agent_id.is_empty()
            && agent_id != "."
            && agent_id != ".."
            && !agent_id.contains(['/', '\\']);
        if !valid {
            return Err(AgentError::InvalidId(agent_id.to_string()));
        }
        Ok(self.root.join(agent_id))
    }

    async fn read_profile(path: &Path) -> Result<AgentProfile, AgentError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| AgentError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_str(&content).map_err(|e| AgentError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl AgentDirectory for FileAgentDirectory {
    async fn list_agents(&self) -> Result<Vec<AgentProfile>, AgentError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Agents directory {} does not exist", self.root.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(AgentError::Read {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut agents = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| AgentError::Read {
            path: self.root.clone(),
            source,
        })? {
            let profile_path = entry.path().join(PROFILE_FILE);
            if !profile_path.is_file() {
                continue;
            }
            match Self::read_profile(&profile_path).await {
                Ok(profile) => agents.push(profile),
                Err(e) => warn!("Skipping agent at {}: {}", entry.path().display(), e),
            }
        }
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    async fn get_agent(&self, agent_id: &str) -> Result<AgentProfile, AgentError> {
        let path = self.agent_dir(agent_id)?.join(PROFILE_FILE);
        if !path.is_file() {
            return Err(AgentError::NotFound(agent_id.to_string()));
        }
        Self::read_profile(&path).await
    }

    async fn system_prompt(&self, agent_id: &str) -> Result<Option<String>, AgentError> {
        let dir = self.agent_dir(agent_id)?;
        if !dir.is_dir() {
            return Err(AgentError::NotFound(agent_id.to_string()));
        }
        let path = dir.join(SYSTEM_PROMPT_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(prompt) if prompt.trim().is_empty() => Ok(None),
            Ok(prompt) => Ok(Some(prompt)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(AgentError::Read { path, source }),
        }
    }
}
