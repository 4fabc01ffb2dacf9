//! Agent profile as stored in `<agents_dir>/<id>/profile.json`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The subset of an agent's profile the router cares about. Unknown keys
/// (stats, equipped skills, connections) are ignored on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default)]
    pub status: Option<String>,
    /// Task class to route this agent's requests under, if not given per request
    #[serde(default)]
    pub task_class: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl AgentProfile {
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            role: None,
            level: None,
            status: None,
            task_class: None,
            created_at: None,
        }
    }
}
