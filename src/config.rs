//! Configuration types.
//!
//! [`SequencerConfig`] describes one registered sequencer: which
//! implementation to instantiate and which path expressions route changes to
//! it. [`SequencingConfig`] holds the tunables of the sequencing system itself.
//! Both are serde types and can be loaded from JSON.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PathExpressionError, RegistryError};
use crate::path::PathExpression;

/// Names the sequencer implementation to instantiate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImplementationRef {
    /// Implementation name resolved by a [`crate::sequencer::FactoryRegistry`].
    pub name: String,
    /// Extra locations the implementation is loaded from, kept for reporting.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classpath: Vec<String>,
}

impl ImplementationRef {
    /// Creates a reference with an empty classpath.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classpath: Vec::new(),
        }
    }
}

/// Configuration of one sequencer.
///
/// The name is the identity: two configurations with the same name describe
/// the same registry entry. Path expressions are trimmed, blank ones dropped
/// and duplicates collapsed, keeping the first occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SequencerConfigRepr")]
pub struct SequencerConfig {
    name: String,
    description: String,
    implementation: ImplementationRef,
    path_expressions: Vec<String>,
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct SequencerConfigRepr {
    name: String,
    #[serde(default)]
    description: String,
    implementation: ImplementationRef,
    #[serde(default)]
    path_expressions: Vec<String>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl TryFrom<SequencerConfigRepr> for SequencerConfig {
    type Error = RegistryError;

    fn try_from(repr: SequencerConfigRepr) -> Result<Self, Self::Error> {
        SequencerConfig::builder()
            .name(repr.name)
            .description(repr.description)
            .implementation(repr.implementation.name)
            .classpath(repr.implementation.classpath)
            .path_expressions(repr.path_expressions)
            .timestamp(repr.timestamp)
            .build()
    }
}

impl SequencerConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> SequencerConfigBuilder {
        SequencerConfigBuilder::default()
    }

    /// Parses a JSON array of configurations.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed JSON or for an entry that
    /// fails validation.
    pub fn list_from_json(json: &str) -> Result<Vec<Self>, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Unique sequencer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free-form description; empty when none was given.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Implementation the factory registry resolves.
    #[must_use]
    pub const fn implementation(&self) -> &ImplementationRef {
        &self.implementation
    }

    /// The normalised path expression texts, in configuration order.
    #[must_use]
    pub fn path_expressions(&self) -> &[String] {
        &self.path_expressions
    }

    /// When this configuration was built.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// True when both configurations describe the same registry entry.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        self.name == other.name
    }

    /// True when anything other than the timestamp differs.
    #[must_use]
    pub fn has_changed(&self, other: &Self) -> bool {
        self.name != other.name
            || self.description != other.description
            || self.implementation != other.implementation
            || self.path_expressions != other.path_expressions
    }

    /// Compiles every path expression.
    ///
    /// # Errors
    ///
    /// Returns the first compilation failure.
    pub fn compile_path_expressions(&self) -> Result<Vec<PathExpression>, PathExpressionError> {
        self.path_expressions.iter().map(PathExpression::compile).collect()
    }
}

/// Builder for [`SequencerConfig`].
#[derive(Debug, Default)]
pub struct SequencerConfigBuilder {
    name: Option<String>,
    description: Option<String>,
    implementation: Option<String>,
    classpath: Vec<String>,
    path_expressions: Vec<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl SequencerConfigBuilder {
    /// Sets the name (required).
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the implementation name (required).
    #[must_use]
    pub fn implementation(mut self, implementation: impl Into<String>) -> Self {
        self.implementation = Some(implementation.into());
        self
    }

    /// Sets the classpath entries recorded with the configuration.
    #[must_use]
    pub fn classpath<I, S>(mut self, classpath: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.classpath = classpath.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one path expression.
    #[must_use]
    pub fn path_expression(mut self, expression: impl Into<String>) -> Self {
        self.path_expressions.push(expression.into());
        self
    }

    /// Adds several path expressions.
    #[must_use]
    pub fn path_expressions<I, S>(mut self, expressions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path_expressions.extend(expressions.into_iter().map(Into::into));
        self
    }

    /// Sets the timestamp; defaults to now.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the name or implementation is missing or
    /// blank.
    pub fn build(self) -> Result<SequencerConfig, RegistryError> {
        let name = required(self.name, "name")?;
        let implementation = required(self.implementation, "implementation")?;

        let mut path_expressions: Vec<String> = Vec::with_capacity(self.path_expressions.len());
        for expression in self.path_expressions {
            let expression = expression.trim();
            if expression.is_empty() || path_expressions.iter().any(|e| e == expression) {
                continue;
            }
            path_expressions.push(expression.to_string());
        }

        Ok(SequencerConfig {
            name,
            description: self.description.map(|d| d.trim().to_string()).unwrap_or_default(),
            implementation: ImplementationRef {
                name: implementation,
                classpath: self.classpath,
            },
            path_expressions,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, RegistryError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RegistryError::InvalidConfig {
            reason: format!("missing required field: {field}"),
        }),
    }
}

/// Tunables of the sequencing system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencingConfig {
    /// Worker threads processing changed nodes.
    pub workers: usize,
    /// Maximum queued node tasks; `None` queues without bound.
    pub queue_capacity: Option<usize>,
    /// Time budget for running all selected sequencers on one node.
    pub task_timeout: Option<Duration>,
    /// Prefix of the worker thread names.
    pub thread_name: String,
}

impl Default for SequencingConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: None,
            task_timeout: None,
            thread_name: "sequencing-worker".to_string(),
        }
    }
}

impl SequencingConfig {
    /// Parses a configuration from JSON; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SequencerConfigBuilder {
        SequencerConfig::builder().name("images").implementation("image")
    }

    #[test]
    fn test_builder_requires_name_and_implementation() {
        let err = SequencerConfig::builder().implementation("x").build().unwrap_err();
        assert!(format!("{err}").contains("name"));
        let err = SequencerConfig::builder().name("  ").implementation("x").build().unwrap_err();
        assert!(format!("{err}").contains("name"));
        let err = SequencerConfig::builder().name("n").build().unwrap_err();
        assert!(format!("{err}").contains("implementation"));
    }

    #[test]
    fn test_path_expressions_are_normalised() {
        let cfg = config()
            .path_expressions([" /a/b ", "", "/c", "/a/b", "   "])
            .path_expression("/d")
            .build()
            .unwrap();
        assert_eq!(cfg.path_expressions(), ["/a/b", "/c", "/d"]);
    }

    #[test]
    fn test_identity_and_change_detection() {
        let ts = Utc::now();
        let a = config().path_expression("/a").timestamp(ts).build().unwrap();
        let b = config().path_expression("/b").timestamp(ts).build().unwrap();
        let c = config().path_expression("/a").build().unwrap();
        let other = SequencerConfig::builder().name("text").implementation("image").build().unwrap();

        assert!(a.is_same(&b));
        assert!(a.has_changed(&b));
        assert!(!a.has_changed(&c));
        assert!(!a.is_same(&other));
    }

    #[test]
    fn test_compile_path_expressions_reports_invalid_text() {
        let cfg = config().path_expressions(["/a", "/b/(c"]).build().unwrap();
        assert!(cfg.compile_path_expressions().is_err());
        let cfg = config().path_expressions(["/a", "/b[c]"]).build().unwrap();
        assert_eq!(cfg.compile_path_expressions().unwrap().len(), 2);
    }

    #[test]
    fn test_list_from_json() {
        let json = r#"[
            {"name": "images", "implementation": {"name": "image", "classpath": ["lib/image.jar"]},
             "path_expressions": ["//(*.jpg|*.png)[*]/jcr:content[@jcr:data]", " "]},
            {"name": "text", "description": "Plain text", "implementation": {"name": "text"}}
        ]"#;
        let configs = SequencerConfig::list_from_json(json).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].implementation().classpath, ["lib/image.jar"]);
        assert_eq!(configs[0].path_expressions().len(), 1);
        assert_eq!(configs[1].description(), "Plain text");
        assert!(configs[1].path_expressions().is_empty());
    }

    #[test]
    fn test_json_rejects_blank_name() {
        let json = r#"[{"name": " ", "implementation": {"name": "text"}}]"#;
        assert!(SequencerConfig::list_from_json(json).is_err());
    }

    #[test]
    fn test_sequencing_config_defaults() {
        let cfg = SequencingConfig::default();
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.queue_capacity, None);
        assert_eq!(cfg.task_timeout, None);

        let cfg = SequencingConfig::from_json(r#"{"workers": 4, "queue_capacity": 64}"#).unwrap();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.queue_capacity, Some(64));
        assert_eq!(cfg.thread_name, "sequencing-worker");
    }
}
