//! Well-known topic names and lookup scopes.

use std::fmt;

/// The four sections of a schema document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicCategory {
    InputBase,
    OutputBase,
    Input,
    Output,
}

impl TopicCategory {
    pub fn key(&self) -> &'static str {
        match self {
            TopicCategory::InputBase => "input_base_topic",
            TopicCategory::OutputBase => "output_base_topic",
            TopicCategory::Input => "input_topic",
            TopicCategory::Output => "output_topic",
        }
    }
}

/// Which user-topic sections a reverse lookup scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Input,
    Output,
    All,
}

impl SearchScope {
    pub(crate) fn categories(&self) -> &'static [TopicCategory] {
        match self {
            SearchScope::Input => &[TopicCategory::Input],
            SearchScope::Output => &[TopicCategory::Output],
            SearchScope::All => &[TopicCategory::Input, TopicCategory::Output],
        }
    }
}

/// Commands the server sends on the base input topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseInputTopic {
    Update,
    EnvUpdate,
    SchemaUpdate,
    LogSync,
}

impl BaseInputTopic {
    pub const ALL: [BaseInputTopic; 4] = [
        BaseInputTopic::Update,
        BaseInputTopic::EnvUpdate,
        BaseInputTopic::SchemaUpdate,
        BaseInputTopic::LogSync,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BaseInputTopic::Update => "update/pepeunit",
            BaseInputTopic::EnvUpdate => "env_update/pepeunit",
            BaseInputTopic::SchemaUpdate => "schema_update/pepeunit",
            BaseInputTopic::LogSync => "log_sync/pepeunit",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

impl fmt::Display for BaseInputTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Topics the unit itself reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseOutputTopic {
    Log,
    State,
}

impl BaseOutputTopic {
    pub fn name(&self) -> &'static str {
        match self {
            BaseOutputTopic::Log => "log/pepeunit",
            BaseOutputTopic::State => "state/pepeunit",
        }
    }
}

impl fmt::Display for BaseOutputTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
