//! Stdout sink
//!
//! Writes forwarded records to stdout for debugging and demos.

use crate::error::SinkError;
use crate::record::Record;
use crate::traits::sink::RecordSink;
use async_trait::async_trait;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Stdout sink configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StdoutSinkConfig {
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,

    /// Prefix each line with the record timestamp (pretty/text only)
    #[serde(default = "default_true")]
    pub include_timestamp: bool,
}

fn default_true() -> bool {
    true
}

/// Output format for the stdout sink
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human readable, payload pretty-printed when it is JSON
    #[default]
    Pretty,
    /// Compact JSON, one line per record
    Json,
    /// Payload only
    Text,
}

/// Sink printing one entry per record
pub struct StdoutSink {
    config: StdoutSinkConfig,
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutSink {
    pub fn new(config: StdoutSinkConfig) -> Self {
        Self::with_writer(config, Box::new(std::io::stdout()))
    }

    /// Write to something other than stdout
    pub fn with_writer(config: StdoutSinkConfig, out: Box<dyn Write + Send>) -> Self {
        Self {
            config,
            out: Mutex::new(out),
        }
    }

    fn io_error(&self, e: std::io::Error) -> SinkError {
        SinkError::new(self.name(), e.to_string())
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new(StdoutSinkConfig::default())
    }
}

#[async_trait]
impl RecordSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn forward(&self, record: Record) -> Result<(), SinkError> {
        let line = format_record(&record, &self.config)
            .map_err(|e| SinkError::new(self.name(), e.to_string()))?;
        writeln!(self.out.lock(), "{}", line).map_err(|e| self.io_error(e))
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.out.lock().flush().map_err(|e| self.io_error(e))
    }
}

/// Render a record as one output entry
pub fn format_record(record: &Record, config: &StdoutSinkConfig) -> serde_json::Result<String> {
    match config.format {
        OutputFormat::Json => serde_json::to_string(record),
        OutputFormat::Pretty => {
            let mut output = String::new();
            if config.include_timestamp {
                output.push_str(&format!(
                    "[{}] ",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f")
                ));
            }
            output.push_str(&record.topic);
            if let Some(offset) = record.offset {
                output.push_str(&format!("@{}", offset));
            }
            if let Some(key) = &record.key {
                output.push_str(&format!(" key={}", String::from_utf8_lossy(key)));
            }
            let payload = match serde_json::from_slice::<serde_json::Value>(&record.value) {
                Ok(json) => serde_json::to_string_pretty(&json)?,
                Err(_) => record.value_str().into_owned(),
            };
            output.push('\n');
            output.push_str(&payload);
            Ok(output)
        }
        OutputFormat::Text => {
            if config.include_timestamp {
                Ok(format!(
                    "{}\t{}",
                    record.timestamp.to_rfc3339(),
                    record.value_str()
                ))
            } else {
                Ok(record.value_str().into_owned())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn record() -> Record {
        Record::new("orders", r#"{"id":1}"#)
            .with_key("k1")
            .with_offset(4)
    }

    #[test]
    fn test_config_parsing() {
        let config: StdoutSinkConfig = serde_yaml::from_str("format: json").unwrap();
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.include_timestamp);
    }

    #[test]
    fn test_json_format_is_one_line() {
        let config = StdoutSinkConfig {
            format: OutputFormat::Json,
            include_timestamp: false,
        };
        let line = format_record(&record(), &config).unwrap();
        assert!(!line.contains('\n'));
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["key"], "k1");
        assert_eq!(json["offset"], 4);
    }

    #[test]
    fn test_pretty_format() {
        let config = StdoutSinkConfig {
            format: OutputFormat::Pretty,
            include_timestamp: false,
        };
        let output = format_record(&record(), &config).unwrap();
        assert!(output.starts_with("orders@4 key=k1\n"));
        assert!(output.contains("\"id\": 1"));
    }

    #[test]
    fn test_text_format_without_timestamp() {
        let config = StdoutSinkConfig {
            format: OutputFormat::Text,
            include_timestamp: false,
        };
        assert_eq!(format_record(&record(), &config).unwrap(), r#"{"id":1}"#);
    }

    #[tokio::test]
    async fn test_forward_writes_lines() {
        let buf = SharedBuf::default();
        let sink = StdoutSink::with_writer(
            StdoutSinkConfig {
                format: OutputFormat::Text,
                include_timestamp: false,
            },
            Box::new(buf.clone()),
        );

        sink.forward(Record::new("t", "a")).await.unwrap();
        sink.forward(Record::new("t", "b")).await.unwrap();
        sink.flush().await.unwrap();

        assert_eq!(String::from_utf8(buf.0.lock().clone()).unwrap(), "a\nb\n");
    }
}
