use std::time::Duration;

use envconfig::Envconfig;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::offset::OffsetSpec;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3400")]
    pub port: u16,

    // JSON array of consumer specs, takes precedence over the path below
    #[envconfig(from = "KAFKA_TAIL_CONSUMERS", default = "")]
    pub consumers: String,

    #[envconfig(from = "KAFKA_TAIL_CONSUMERS_PATH")]
    pub consumers_path: Option<String>,

    #[envconfig(from = "KAFKA_TLS", default = "false")]
    pub kafka_tls: bool,

    #[envconfig(from = "KAFKA_CLIENT_TIMEOUT_MS", default = "10000")]
    pub kafka_client_timeout_ms: u64,

    #[envconfig(from = "CHANNEL_BUFFER_SIZE", default = "256")]
    pub channel_buffer_size: usize,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn kafka_client_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_client_timeout_ms)
    }

    /// Load and validate the consumer specs from the inline JSON, falling back to
    /// the JSON file at `KAFKA_TAIL_CONSUMERS_PATH`.
    pub fn consumer_specs(&self) -> Result<Vec<ConsumerSpec>, ConfigError> {
        if !self.consumers.trim().is_empty() {
            return parse_consumer_specs(&self.consumers);
        }

        match &self.consumers_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                parse_consumer_specs(&raw)
            }
            None => Err(ConfigError::NoConsumers),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no consumers configured, set KAFKA_TAIL_CONSUMERS or KAFKA_TAIL_CONSUMERS_PATH")]
    NoConsumers,

    #[error("failed to read consumer config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse consumer config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("consumer #{index}: {reason}")]
    Invalid { index: usize, reason: String },
}

/// Which partitions of a topic a consumer spec targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NumberOrString", into = "NumberOrString")]
pub enum PartitionSelector {
    #[default]
    All,
    Single(i32),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    Text(String),
}

impl TryFrom<NumberOrString> for PartitionSelector {
    type Error = String;

    fn try_from(raw: NumberOrString) -> Result<Self, Self::Error> {
        match raw {
            NumberOrString::Number(-1) => Ok(PartitionSelector::All),
            NumberOrString::Number(n) => i32::try_from(n)
                .ok()
                .filter(|n| *n >= 0)
                .map(PartitionSelector::Single)
                .ok_or_else(|| format!("invalid partition {n}")),
            NumberOrString::Text(s) if s == "all" => Ok(PartitionSelector::All),
            NumberOrString::Text(s) => s
                .parse::<i32>()
                .map_err(|_| format!("invalid partition {s:?}"))
                .and_then(|n| NumberOrString::Number(i64::from(n)).try_into()),
        }
    }
}

impl From<PartitionSelector> for NumberOrString {
    fn from(selector: PartitionSelector) -> Self {
        match selector {
            PartitionSelector::All => NumberOrString::Text("all".to_string()),
            PartitionSelector::Single(n) => NumberOrString::Number(i64::from(n)),
        }
    }
}

/// One configured (brokers, topic, partition, offset) read target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSpec {
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(default)]
    pub partition: PartitionSelector,
    #[serde(default = "default_offset", deserialize_with = "deserialize_offset")]
    pub offset: String,
}

fn default_offset() -> String {
    "newest".to_string()
}

fn deserialize_offset<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n.to_string()),
        NumberOrString::Text(s) => Ok(s),
    }
}

impl ConsumerSpec {
    pub fn new(
        brokers: &[&str],
        topic: &str,
        partition: PartitionSelector,
        offset: &str,
    ) -> Self {
        Self {
            brokers: brokers.iter().map(|b| b.to_string()).collect(),
            topic: topic.to_string(),
            partition,
            offset: offset.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.brokers.is_empty() || self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err("brokers must be a non-empty list of addresses".to_string());
        }
        if self.topic.trim().is_empty() {
            return Err("topic must not be empty".to_string());
        }
        self.offset
            .parse::<OffsetSpec>()
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

pub fn parse_consumer_specs(raw: &str) -> Result<Vec<ConsumerSpec>, ConfigError> {
    let specs: Vec<ConsumerSpec> = serde_json::from_str(raw)?;
    if specs.is_empty() {
        return Err(ConfigError::NoConsumers);
    }
    for (index, spec) in specs.iter().enumerate() {
        spec.validate().map_err(|reason| ConfigError::Invalid { index, reason })?;
    }
    Ok(specs)
}
