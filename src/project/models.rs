use schemars::JsonSchema;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_valid::Validate;
use std::time::Duration;
use tracing::warn;

use crate::graph::Position;
use crate::model::{
    DEFAULT_CONFIDENCE, DEFAULT_REPEAT_COUNT, DEFAULT_REPEAT_INTERVAL, DEFAULT_SEARCH_TIMEOUT,
    StepSettings,
};

const STEP_KEY_PREFIX: &str = "Step";

/// Persisted step settings. Times are in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct SettingsRecord {
    #[serde(default = "default_timeout")]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 86400.0)]
    pub timeout: f64,

    #[serde(default = "default_repeat_clicks")]
    #[validate(minimum = 1)]
    pub repeat_clicks: u32,

    #[serde(default = "default_click_interval")]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 3600.0)]
    pub click_interval: f64,

    #[serde(default = "default_confidence")]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 1.0)]
    pub confidence: f64,
}

fn default_timeout() -> f64 {
    DEFAULT_SEARCH_TIMEOUT.as_secs_f64()
}

fn default_repeat_clicks() -> u32 {
    DEFAULT_REPEAT_COUNT
}

fn default_click_interval() -> f64 {
    DEFAULT_REPEAT_INTERVAL.as_secs_f64()
}

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self::from(&StepSettings::default())
    }
}

impl From<&StepSettings> for SettingsRecord {
    fn from(settings: &StepSettings) -> Self {
        Self {
            timeout: settings.search_timeout.as_secs_f64(),
            repeat_clicks: settings.repeat_count,
            click_interval: settings.repeat_interval.as_secs_f64(),
            confidence: settings.confidence_threshold,
        }
    }
}

impl SettingsRecord {
    /// Validated conversion into runtime settings.
    pub fn to_settings(&self) -> anyhow::Result<StepSettings> {
        self.validate()
            .map_err(|errors| anyhow::anyhow!("Step settings out of range: {errors}"))?;
        Ok(StepSettings {
            confidence_threshold: self.confidence,
            search_timeout: Duration::try_from_secs_f64(self.timeout)?,
            repeat_count: self.repeat_clicks.max(1),
            repeat_interval: Duration::try_from_secs_f64(self.click_interval)?,
        })
    }
}

/// Object form of a persisted step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DetailedStep {
    /// Reference image name, relative to the images directory.
    pub location: String,
    #[serde(flatten)]
    pub settings: SettingsRecord,
}

/// One persisted step: a bare image name (legacy) or an object.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum StepRecord {
    Legacy(String),
    Detailed(DetailedStep),
}

impl StepRecord {
    pub fn location(&self) -> &str {
        match self {
            StepRecord::Legacy(location) => location,
            StepRecord::Detailed(step) => &step.location,
        }
    }

    /// Settings with absent fields defaulted.
    pub fn settings(&self) -> SettingsRecord {
        match self {
            StepRecord::Legacy(_) => SettingsRecord::default(),
            StepRecord::Detailed(step) => step.settings,
        }
    }
}

/// Ordered step list, persisted as `{"Step1": .., "Step2": .., ...}`.
///
/// Reading stops at the first missing index; anything else in the object is
/// ignored with a warning. Writing always uses the object form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepSequenceDoc(pub Vec<StepRecord>);

impl Serialize for StepSequenceDoc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (i, record) in self.0.iter().enumerate() {
            let detailed = StepRecord::Detailed(DetailedStep {
                location: record.location().to_string(),
                settings: record.settings(),
            });
            map.serialize_entry(&format!("{STEP_KEY_PREFIX}{}", i + 1), &detailed)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StepSequenceDoc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut entries = Map::<String, Value>::deserialize(deserializer)?;
        let mut records = Vec::new();
        while let Some(value) = entries.remove(&format!("{STEP_KEY_PREFIX}{}", records.len() + 1)) {
            let key = records.len() + 1;
            let record = StepRecord::deserialize(value)
                .map_err(|e| de::Error::custom(format!("{STEP_KEY_PREFIX}{key}: {e}")))?;
            records.push(record);
        }
        if !entries.is_empty() {
            let ignored: Vec<&str> = entries.keys().map(String::as_str).collect();
            warn!(
                target: "clickflow::project",
                read = records.len(),
                ignored = %ignored.join(", "),
                "Ignoring step entries after the first gap or with unexpected keys"
            );
        }
        Ok(StepSequenceDoc(records))
    }
}

/// Persisted connection. `to` is the edge's origin and `from` its destination.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub from: String,
    pub to: String,
}

impl ConnectionRecord {
    /// Record for the edge "`origin` executes, then `destination`".
    pub fn between(origin: &str, destination: &str) -> Self {
        Self {
            from: destination.to_string(),
            to: origin.to_string(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.to
    }

    pub fn destination(&self) -> &str {
        &self.from
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct NodeEntry {
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsRecord>,
}

/// A project file: node entries keyed by node name, plus an optional `steps`
/// key holding the last compiled sequence. Entry order is preserved both ways.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDocument {
    pub nodes: Vec<(String, NodeEntry)>,
    pub steps: Option<StepSequenceDoc>,
}

const STEPS_KEY: &str = "steps";

impl Serialize for GraphDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.nodes.len() + usize::from(self.steps.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        for (name, entry) in &self.nodes {
            map.serialize_entry(name, entry)?;
        }
        if let Some(steps) = &self.steps {
            map.serialize_entry(STEPS_KEY, steps)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for GraphDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Map::<String, Value>::deserialize(deserializer)?;
        let mut doc = GraphDocument::default();
        for (key, value) in entries {
            if key == STEPS_KEY {
                let steps = StepSequenceDoc::deserialize(value)
                    .map_err(|e| de::Error::custom(format!("steps: {e}")))?;
                doc.steps = Some(steps);
                continue;
            }
            let entry = NodeEntry::deserialize(value)
                .map_err(|e| de::Error::custom(format!("node '{key}': {e}")))?;
            doc.nodes.push((key, entry));
        }
        Ok(doc)
    }
}
