//! # Topic Schema
//!
//! Maps the logical topic names the application works with onto the
//! fully-qualified strings used on the wire, and classifies inbound topics
//! back to logical names.
//!
//! ## Snapshots
//!
//! A [`TopicSchema`] is immutable. [`SchemaStore`] keeps the current one
//! behind an `RwLock<Arc<_>>`; an update builds a complete new schema and
//! swaps the `Arc`, so a reader holding a snapshot sees either the old or the
//! new mapping in full.
//!
//! ## Lookup order
//!
//! Sections are `BTreeMap`s, so when two logical names share a wire topic the
//! lexicographically first name wins. Schemas issued by the server do not
//! overlap; callers should not depend on the tie-break.

pub mod topics;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PepeunitError, Result};
use crate::files;

pub use topics::{BaseInputTopic, BaseOutputTopic, SearchScope, TopicCategory};

/// `logical name -> fully-qualified topics`, in schema order.
pub type TopicMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSchema {
    #[serde(default)]
    pub input_base_topic: TopicMap,
    #[serde(default)]
    pub output_base_topic: TopicMap,
    #[serde(default)]
    pub input_topic: TopicMap,
    #[serde(default)]
    pub output_topic: TopicMap,
}

/// Second path segment of `domain/unit-node-id/suffix`.
fn unit_node_id(topic: &str) -> Option<&str> {
    topic.split('/').nth(1)
}

impl TopicSchema {
    pub fn section(&self, category: TopicCategory) -> &TopicMap {
        match category {
            TopicCategory::InputBase => &self.input_base_topic,
            TopicCategory::OutputBase => &self.output_base_topic,
            TopicCategory::Input => &self.input_topic,
            TopicCategory::Output => &self.output_topic,
        }
    }

    fn find_in_scope<F>(&self, scope: SearchScope, matches: F) -> Option<&str>
    where
        F: Fn(&str) -> bool,
    {
        scope.categories().iter().find_map(|category| {
            self.section(*category)
                .iter()
                .find(|(_, topics)| topics.iter().any(|t| matches(t)))
                .map(|(name, _)| name.as_str())
        })
    }

    pub fn find_by_exact_topic(&self, topic: &str, scope: SearchScope) -> Result<&str> {
        self.find_in_scope(scope, |candidate| candidate == topic)
            .ok_or_else(|| PepeunitError::TopicNotFound(topic.to_string()))
    }

    pub fn find_by_unit_node_id(&self, id: &str, scope: SearchScope) -> Result<&str> {
        self.find_in_scope(scope, |candidate| unit_node_id(candidate) == Some(id))
            .ok_or_else(|| PepeunitError::TopicNotFound(id.to_string()))
    }

    /// Classifies an inbound topic as one of the server command topics.
    pub fn find_base_input(&self, topic: &str) -> Option<BaseInputTopic> {
        self.input_base_topic
            .iter()
            .find(|(_, topics)| topics.iter().any(|t| t == topic))
            .and_then(|(name, _)| BaseInputTopic::from_name(name))
    }

    /// Everything the unit listens on: base input topics, then user input topics.
    pub fn subscription_topics(&self) -> Vec<String> {
        self.input_base_topic
            .values()
            .chain(self.input_topic.values())
            .flatten()
            .cloned()
            .collect()
    }

    /// Wire topics for a logical output name, user section first.
    pub fn output_topics(&self, name: &str) -> Vec<String> {
        self.output_topic
            .get(name)
            .into_iter()
            .chain(self.output_base_topic.get(name))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn base_output_topic(&self, topic: BaseOutputTopic) -> Option<&str> {
        self.output_base_topic
            .get(topic.name())
            .and_then(|topics| topics.first())
            .map(String::as_str)
    }
}

/// File-backed holder of the current schema snapshot.
#[derive(Debug)]
pub struct SchemaStore {
    path: PathBuf,
    current: RwLock<Arc<TopicSchema>>,
}

impl SchemaStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let schema = Self::read(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(schema)),
        })
    }

    pub fn from_schema(path: impl Into<PathBuf>, schema: TopicSchema) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(schema)),
        }
    }

    fn read(path: &Path) -> Result<TopicSchema> {
        let value = files::read_json_value(path)?;
        serde_json::from_value(value)
            .map_err(|e| PepeunitError::Schema(format!("{}: {}", path.display(), e)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<TopicSchema> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Makes `schema` current without touching the file.
    pub fn reload(&self, schema: TopicSchema) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(schema);
    }

    /// Persists `schema` and makes it current.
    pub fn update_schema(&self, schema: TopicSchema) -> Result<()> {
        files::write_json(&self.path, &schema)?;
        self.reload(schema);
        Ok(())
    }

    pub fn update_from_file(&self) -> Result<()> {
        let schema = Self::read(&self.path)?;
        self.reload(schema);
        info!("Schema reloaded from {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_schema() -> TopicSchema {
    serde_json::from_value(serde_json::json!({
        "input_base_topic": {
            "update/pepeunit": ["broker.example.com/unit-1/update/pepeunit"],
            "env_update/pepeunit": ["broker.example.com/unit-1/env_update/pepeunit"],
            "schema_update/pepeunit": ["broker.example.com/unit-1/schema_update/pepeunit"],
            "log_sync/pepeunit": ["broker.example.com/unit-1/log_sync/pepeunit"]
        },
        "output_base_topic": {
            "log/pepeunit": ["broker.example.com/unit-1/log/pepeunit"],
            "state/pepeunit": ["broker.example.com/unit-1/state/pepeunit"]
        },
        "input_topic": {
            "x": ["broker/550e8400/pepeunit"]
        },
        "output_topic": {
            "output/pepeunit": ["broker/7c9e6679/pepeunit", "broker/7c9e6679"]
        }
    }))
    .expect("sample schema is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_node_lookup_respects_scope() {
        let schema = sample_schema();
        assert_eq!(
            schema
                .find_by_unit_node_id("550e8400", SearchScope::Input)
                .unwrap(),
            "x"
        );
        assert!(matches!(
            schema.find_by_unit_node_id("550e8400", SearchScope::Output),
            Err(PepeunitError::TopicNotFound(_))
        ));
        assert_eq!(
            schema
                .find_by_unit_node_id("7c9e6679", SearchScope::All)
                .unwrap(),
            "output/pepeunit"
        );
    }

    #[test]
    fn exact_lookup_ignores_base_sections() {
        let schema = sample_schema();
        assert_eq!(
            schema
                .find_by_exact_topic("broker/7c9e6679", SearchScope::Output)
                .unwrap(),
            "output/pepeunit"
        );
        assert!(schema
            .find_by_exact_topic(
                "broker.example.com/unit-1/update/pepeunit",
                SearchScope::All
            )
            .is_err());
    }

    #[test]
    fn base_inputs_are_classified() {
        let schema = sample_schema();
        assert_eq!(
            schema.find_base_input("broker.example.com/unit-1/update/pepeunit"),
            Some(BaseInputTopic::Update)
        );
        assert_eq!(
            schema.find_base_input("broker.example.com/unit-1/log_sync/pepeunit"),
            Some(BaseInputTopic::LogSync)
        );
        assert_eq!(schema.find_base_input("broker/550e8400/pepeunit"), None);
    }

    #[test]
    fn subscription_and_output_topics() {
        let schema = sample_schema();
        let subs = schema.subscription_topics();
        assert_eq!(subs.len(), 5);
        assert!(subs.contains(&"broker/550e8400/pepeunit".to_string()));

        assert_eq!(
            schema.output_topics("output/pepeunit"),
            vec!["broker/7c9e6679/pepeunit", "broker/7c9e6679"]
        );
        assert_eq!(
            schema.output_topics("state/pepeunit"),
            vec!["broker.example.com/unit-1/state/pepeunit"]
        );
        assert!(schema.output_topics("missing").is_empty());
    }

    #[test]
    fn reload_swaps_whole_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        files::write_json(&path, &sample_schema()).unwrap();
        let store = SchemaStore::load(&path).unwrap();

        let old = store.snapshot();
        store.update_schema(TopicSchema::default()).unwrap();

        assert_eq!(old.input_topic.len(), 1);
        assert!(store.snapshot().input_topic.is_empty());

        let reread = SchemaStore::load(&path).unwrap();
        assert_eq!(*reread.snapshot(), TopicSchema::default());
    }
}
