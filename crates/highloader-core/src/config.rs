use crate::error::{ConfigParseError, RequestConfigError};
use crate::params::{CallParams, DEFAULT_RATE};
use crate::preview::example_payload;
use crate::schema::ParsedSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Persisted run configuration: one target host, any number of schema
/// files, any number of request entries per file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub proto: Vec<ProtoConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtoConfig {
    pub file_path: String,
    #[serde(default)]
    pub requests: Vec<RequestConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Payload template
    #[serde(default)]
    pub message: String,
    /// Calls per second, kept as text the way it was entered
    #[serde(default)]
    pub rps: String,
    #[serde(default)]
    pub stop_after: TimeValue,
    #[serde(default)]
    pub request_deadline: TimeValue,
    /// Short or fully-qualified service name
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    /// Where to write the final outcome snapshot, if anywhere
    #[serde(default)]
    pub metrics_path: String,
    #[serde(default)]
    pub log_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

/// A `(magnitude, unit)` pair such as `("10", "Seconds")`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeValue {
    #[serde(default)]
    pub duration: String,
    #[serde(default, rename = "type")]
    pub unit: String,
}

impl TimeValue {
    pub fn new(duration: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            duration: duration.into(),
            unit: unit.into(),
        }
    }

    /// `Ok(None)` when either half is blank or the magnitude is zero.
    pub fn to_duration(&self, field: &str) -> Result<Option<Duration>, ConfigParseError> {
        let magnitude = self.duration.trim();
        let unit = self.unit.trim();
        if magnitude.is_empty() || unit.is_empty() {
            return Ok(None);
        }

        let value: u64 = magnitude.parse().map_err(|_| {
            ConfigParseError::new(field, format!("{magnitude:?} is not a whole number"))
        })?;
        let duration = match unit.to_ascii_lowercase().as_str() {
            "milliseconds" | "millisecond" | "ms" => Duration::from_millis(value),
            "seconds" | "second" | "sec" | "s" => Duration::from_secs(value),
            "minutes" | "minute" | "min" | "m" => Duration::from_secs(value.saturating_mul(60)),
            "hours" | "hour" | "h" => Duration::from_secs(value.saturating_mul(3600)),
            _ => {
                return Err(ConfigParseError::new(
                    field,
                    format!("unknown time unit {unit:?}"),
                ))
            }
        };

        Ok((!duration.is_zero()).then_some(duration))
    }
}

impl RequestConfig {
    /// Blank means the default rate; anything else must be a positive
    /// whole number.
    pub fn rate(&self) -> Result<u64, ConfigParseError> {
        let rps = self.rps.trim();
        if rps.is_empty() {
            return Ok(DEFAULT_RATE);
        }
        match rps.parse::<u64>() {
            Ok(0) => Err(ConfigParseError::new("rps", "must be greater than zero")),
            Ok(rate) => Ok(rate),
            Err(_) => Err(ConfigParseError::new(
                "rps",
                format!("{rps:?} is not a whole number"),
            )),
        }
    }

    /// Build call parameters against `schema`. A malformed time value is
    /// logged and treated as absent; a bad rate or unknown method fails the
    /// whole entry.
    pub fn to_call_params(
        &self,
        schema: Arc<ParsedSchema>,
        host: &str,
    ) -> Result<CallParams, RequestConfigError> {
        let rate = self.rate()?;
        let stop_after = lenient_duration(&self.stop_after, "stop_after");
        let deadline = lenient_duration(&self.request_deadline, "request_deadline");

        let mut params = CallParams::new(schema, host, &self.service, &self.method)?
            .with_rate(rate)
            .with_stop_after(stop_after)
            .with_deadline(deadline);
        if !self.message.trim().is_empty() {
            params = params.with_template(self.message.clone());
        }
        for entry in &self.metadata {
            if entry.key.trim().is_empty() {
                continue;
            }
            params = params.with_header(entry.key.trim(), entry.value.clone());
        }
        Ok(params)
    }
}

fn lenient_duration(value: &TimeValue, field: &str) -> Option<Duration> {
    match value.to_duration(field) {
        Ok(duration) => duration,
        Err(e) => {
            warn!("Ignoring {}: {}", field, e);
            None
        }
    }
}

impl RunConfig {
    /// A starting configuration for every unary method in `schema`, with an
    /// example payload per method.
    pub fn skeleton(schema: &ParsedSchema, host: &str) -> Self {
        let requests = schema
            .unary_methods()
            .map(|(service, method)| RequestConfig {
                message: example_payload(&method.request, schema),
                rps: "10".to_string(),
                stop_after: TimeValue::new("10", "Seconds"),
                request_deadline: TimeValue::new("1", "Seconds"),
                service: service.name.clone(),
                method: method.name.clone(),
                ..RequestConfig::default()
            })
            .collect();

        Self {
            host: host.to_string(),
            proto: vec![ProtoConfig {
                file_path: schema.source_path.display().to_string(),
                requests,
            }],
        }
    }

    pub fn request_count(&self) -> usize {
        self.proto.iter().map(|p| p.requests.len()).sum()
    }
}
