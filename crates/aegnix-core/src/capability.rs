//! Declared publish/subscribe participation of an agent.
//!
//! A capability is what an agent asks to do, not a grant: the bridge stores
//! the latest declaration per agent and routing layers decide what to honor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Latest capability declaration of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Declaring agent
    pub agent_id: String,
    /// Subjects the agent publishes to
    #[serde(default)]
    pub publishes: Vec<String>,
    /// Subjects the agent subscribes to
    #[serde(default)]
    pub subscribes: Vec<String>,
    /// Free-form metadata
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Time of the declaration (ms since epoch), set by the engine
    #[serde(default)]
    pub updated_at_millis: u64,
}

impl Capability {
    /// Empty declaration for `agent_id`.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            publishes: Vec::new(),
            subscribes: Vec::new(),
            meta: BTreeMap::new(),
            updated_at_millis: 0,
        }
    }

    /// Add a published subject.
    #[must_use]
    pub fn publishing(mut self, subject: impl Into<String>) -> Self {
        self.publishes.push(subject.into());
        self
    }

    /// Add a subscribed subject.
    #[must_use]
    pub fn subscribing(mut self, subject: impl Into<String>) -> Self {
        self.subscribes.push(subject.into());
        self
    }

    /// Set a metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Returns true if the agent declared `subject` as published.
    pub fn publishes_to(&self, subject: &str) -> bool {
        self.publishes.iter().any(|s| s == subject)
    }

    /// Returns true if the agent declared `subject` as subscribed.
    pub fn subscribes_to(&self, subject: &str) -> bool {
        self.subscribes.iter().any(|s| s == subject)
    }
}
