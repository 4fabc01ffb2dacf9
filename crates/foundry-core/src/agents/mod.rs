//! Agent directory: where agent profiles and system prompts live
//!
//! Agents are created and managed elsewhere; the router only reads an
//! agent's profile and system prompt through the [`AgentDirectory`] trait.

pub mod directory;
pub mod profile;

pub use directory::{AgentDirectory, AgentError, FileAgentDirectory};
pub use profile::AgentProfile;
