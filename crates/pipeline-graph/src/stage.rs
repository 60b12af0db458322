//! Stage identity and endpoint descriptions.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Network endpoint role supervised by a watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// Ingest side: the stage pulling a remote stream into the pipeline.
    Source,
    /// Egress side: the stage pushing processed output to a remote endpoint.
    Destination,
}

impl EndpointRole {
    /// Both roles, source first.
    pub const ALL: [EndpointRole; 2] = [EndpointRole::Source, EndpointRole::Destination];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointRole::Source => "source",
            EndpointRole::Destination => "destination",
        }
    }

    /// The other endpoint of the same instance.
    pub fn peer(&self) -> EndpointRole {
        match self {
            EndpointRole::Source => EndpointRole::Destination,
            EndpointRole::Destination => EndpointRole::Source,
        }
    }
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a stage as reported by the graph.
///
/// This is an explicit capability answer from the pipeline; callers never
/// inspect concrete stage types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageRole {
    Source,
    Destination,
    /// Stage that fans frames out to destination stages (e.g. an overlay node).
    Relay,
    Other,
}

impl From<EndpointRole> for StageRole {
    fn from(role: EndpointRole) -> Self {
        match role {
            EndpointRole::Source => StageRole::Source,
            EndpointRole::Destination => StageRole::Destination,
        }
    }
}

/// Opaque reference to a stage in an instance's pipeline graph.
///
/// Holding a handle never keeps a stage alive; the graph owns its stages and
/// resolves handles on every call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageHandle(String);

impl StageHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageHandle {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Configuration needed to reconstruct an endpoint stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Remote stream URL.
    pub url: String,
    /// Channel index the stage is bound to.
    #[serde(default)]
    pub channel: u32,
    /// Additional transport parameters.
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_role_peer() {
        assert_eq!(EndpointRole::Source.peer(), EndpointRole::Destination);
        assert_eq!(EndpointRole::Destination.peer(), EndpointRole::Source);
    }

    #[test]
    fn test_stage_role_from_endpoint_role() {
        assert_eq!(StageRole::from(EndpointRole::Source), StageRole::Source);
        assert_eq!(
            StageRole::from(EndpointRole::Destination),
            StageRole::Destination
        );
    }

    #[test]
    fn test_endpoint_config_deserialize_defaults() {
        let config: EndpointConfig =
            serde_json::from_str(r#"{"url":"rtmp://example.com/live/cam1"}"#).unwrap();
        assert_eq!(config.url, "rtmp://example.com/live/cam1");
        assert_eq!(config.channel, 0);
        assert!(config.extra.is_empty());
    }
}
