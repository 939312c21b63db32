//! Datagen source connector
//!
//! Generates records locally, without any external system. It is the load
//! generator behind the `bench` command and a convenient stand-in for a
//! workspace when trying out a pipeline.
//!
//! # Patterns
//!
//! - `sequence`: sequential integers (0, 1, 2, ...)
//! - `random`: random JSON objects
//! - `users`: fake user records with names, emails, etc.
//! - `orders`: fake e-commerce orders
//! - `events`: generic event stream with type/payload
//! - `metrics`: time-series metric data
//! - `key_value`: simple key-value pairs
//!
//! # Example Configuration
//!
//! ```yaml
//! sources:
//!   demo:
//!     connector: datagen
//!     topic: demo-events
//!     config:
//!       pattern: orders
//!       events_per_second: 10
//!       max_events: 1000
//! ```

use crate::error::{ConnectorError, ConnectorResult};
use crate::record::{Cursor, Record};
use crate::traits::connector::{ConnectorState, Lifecycle, Produced, SourceConnector};
use crate::traits::registry::{ConnectorSpec, SourceFactory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use validator::Validate;

/// Datagen source configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct DatagenConfig {
    /// Data pattern to generate
    #[serde(default)]
    pub pattern: DataPattern,

    /// Records per second (0 = as fast as possible)
    #[serde(default = "default_events_per_second")]
    #[validate(range(max = 1_000_000))]
    pub events_per_second: u32,

    /// Records to generate before EndOfStream (0 = unlimited)
    #[serde(default)]
    pub max_events: u64,

    /// Add a `_sequence` field to every record
    #[serde(default = "default_true")]
    pub include_sequence: bool,

    /// Add a `_timestamp` field to every record
    #[serde(default = "default_true")]
    pub include_timestamp: bool,

    /// Fields added to every record
    #[serde(default)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,

    /// Seed for reproducible output
    pub seed: Option<u64>,
}

fn default_events_per_second() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for DatagenConfig {
    fn default() -> Self {
        Self {
            pattern: DataPattern::default(),
            events_per_second: default_events_per_second(),
            max_events: 0,
            include_sequence: true,
            include_timestamp: true,
            custom_fields: BTreeMap::new(),
            seed: None,
        }
    }
}

/// Data generation patterns
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataPattern {
    Sequence,
    #[default]
    Random,
    Users,
    Orders,
    Events,
    Metrics,
    KeyValue,
}

impl std::fmt::Display for DataPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequence => write!(f, "sequence"),
            Self::Random => write!(f, "random"),
            Self::Users => write!(f, "users"),
            Self::Orders => write!(f, "orders"),
            Self::Events => write!(f, "events"),
            Self::Metrics => write!(f, "metrics"),
            Self::KeyValue => write!(f, "key_value"),
        }
    }
}

/// xorshift64, reproducible from a seed
#[derive(Debug)]
struct Rng {
    state: u64,
}

impl Rng {
    const FALLBACK_SEED: u64 = 0x853c49e6748fea9b;

    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { Self::FALLBACK_SEED } else { seed },
        }
    }

    fn from_time() -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(Self::FALLBACK_SEED);
        Self::new(seed)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() as f64) / (u64::MAX as f64)
    }

    fn range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        min + (self.next_u64() % (max - min))
    }

    fn choose<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        let idx = self.range(0, items.len() as u64) as usize;
        &items[idx]
    }

    fn bool(&mut self) -> bool {
        self.next_u64() % 2 == 0
    }
}

/// Produces one JSON payload per call
#[derive(Debug)]
struct DataGenerator {
    rng: Rng,
    sequence: u64,
    config: DatagenConfig,
}

impl DataGenerator {
    fn new(config: DatagenConfig) -> Self {
        let rng = config.seed.map(Rng::new).unwrap_or_else(Rng::from_time);
        Self {
            rng,
            sequence: 0,
            config,
        }
    }

    /// Next payload and its record key
    fn generate(&mut self) -> (String, serde_json::Value) {
        let seq = self.sequence;
        self.sequence += 1;
        let now = Utc::now();

        let (key, mut data) = match self.config.pattern {
            DataPattern::Sequence => (seq.to_string(), serde_json::json!({ "value": seq })),
            DataPattern::Random => (seq.to_string(), self.random()),
            DataPattern::Users => (format!("user_{:08}", seq), self.user(seq)),
            DataPattern::Orders => (format!("ORD-{:08}", seq), self.order(seq)),
            DataPattern::Events => (seq.to_string(), self.event(seq)),
            DataPattern::Metrics => (seq.to_string(), self.metric(seq, now)),
            DataPattern::KeyValue => (format!("key_{:08}", seq), self.key_value(seq)),
        };

        if let serde_json::Value::Object(ref mut map) = data {
            if self.config.include_sequence {
                map.insert("_sequence".to_string(), serde_json::json!(seq));
            }
            if self.config.include_timestamp {
                map.insert("_timestamp".to_string(), serde_json::json!(now.to_rfc3339()));
            }
            for (field, value) in &self.config.custom_fields {
                map.insert(field.clone(), value.clone());
            }
        }

        (key, data)
    }

    fn random(&mut self) -> serde_json::Value {
        serde_json::json!({
            "id": format!("{:016x}", self.rng.next_u64()),
            "value": self.rng.range(0, 1000),
            "ratio": (self.rng.next_f64() * 100.0).round() / 100.0,
            "active": self.rng.bool(),
            "category": self.rng.choose(&["A", "B", "C", "D"]),
        })
    }

    fn user(&mut self, seq: u64) -> serde_json::Value {
        const FIRST_NAMES: &[&str] = &[
            "Alice", "Bob", "Carol", "David", "Eve", "Frank", "Grace", "Henry", "Ivy", "Jack",
        ];
        const LAST_NAMES: &[&str] = &[
            "Smith", "Johnson", "Brown", "Garcia", "Miller", "Davis", "Taylor", "Moore",
        ];
        const DOMAINS: &[&str] = &["example.com", "test.org", "demo.net"];
        const COUNTRIES: &[&str] = &["US", "UK", "DE", "FR", "JP", "AU", "CA", "BR"];

        let first = self.rng.choose(FIRST_NAMES);
        let last = self.rng.choose(LAST_NAMES);
        let domain = self.rng.choose(DOMAINS);
        let signup = Utc::now() - chrono::Duration::days(self.rng.range(0, 365 * 3) as i64);

        serde_json::json!({
            "user_id": format!("user_{:08}", seq),
            "first_name": first,
            "last_name": last,
            "email": format!("{}.{}@{}", first.to_lowercase(), last.to_lowercase(), domain),
            "age": self.rng.range(18, 80),
            "country": self.rng.choose(COUNTRIES),
            "premium": self.rng.bool(),
            "signup_date": signup.format("%Y-%m-%d").to_string(),
        })
    }

    fn order(&mut self, seq: u64) -> serde_json::Value {
        const PRODUCTS: &[&str] = &[
            "Widget Pro", "Gadget X", "Super Tool", "Mega Device", "Smart Hub", "Data Box",
        ];
        const STATUSES: &[&str] = &["pending", "confirmed", "shipped", "delivered", "cancelled"];
        const CURRENCIES: &[&str] = &["USD", "EUR", "GBP", "JPY"];

        let quantity = self.rng.range(1, 10);
        let unit_price = ((self.rng.next_f64() * 200.0 + 10.0) * 100.0).round() / 100.0;
        let created = Utc::now() - chrono::Duration::seconds(self.rng.range(0, 86400 * 7) as i64);

        serde_json::json!({
            "order_id": format!("ORD-{:08}", seq),
            "customer_id": format!("user_{:08}", self.rng.range(1, 10000)),
            "product": self.rng.choose(PRODUCTS),
            "quantity": quantity,
            "unit_price": unit_price,
            "total_amount": unit_price * quantity as f64,
            "currency": self.rng.choose(CURRENCIES),
            "status": self.rng.choose(STATUSES),
            "created_at": created.to_rfc3339(),
        })
    }

    fn event(&mut self, seq: u64) -> serde_json::Value {
        const EVENT_TYPES: &[&str] = &[
            "page_view", "click", "signup", "purchase", "search", "add_to_cart", "checkout",
        ];
        const SOURCES: &[&str] = &["web", "mobile_ios", "mobile_android", "api"];

        let event_type = *self.rng.choose(EVENT_TYPES);
        let payload = match event_type {
            "page_view" => serde_json::json!({
                "url": format!("/page/{}", self.rng.range(1, 100)),
                "duration_ms": self.rng.range(100, 30000),
            }),
            "click" => serde_json::json!({
                "element_id": format!("btn_{}", self.rng.range(1, 50)),
                "x": self.rng.range(0, 1920),
                "y": self.rng.range(0, 1080),
            }),
            "purchase" => serde_json::json!({
                "amount": (self.rng.next_f64() * 50000.0).round() / 100.0,
                "items": self.rng.range(1, 10),
            }),
            _ => serde_json::json!({}),
        };

        serde_json::json!({
            "event_id": format!("evt_{:016x}", self.rng.next_u64()),
            "event_type": event_type,
            "sequence": seq,
            "source": self.rng.choose(SOURCES),
            "user_id": format!("user_{:08}", self.rng.range(1, 10000)),
            "payload": payload,
        })
    }

    fn metric(&mut self, seq: u64, now: DateTime<Utc>) -> serde_json::Value {
        const METRICS: &[(&str, &str, f64)] = &[
            ("cpu_usage", "percent", 100.0),
            ("memory_used", "percent", 100.0),
            ("latency_ms", "milliseconds", 500.0),
            ("requests_per_sec", "req/s", 10_000.0),
            ("network_rx", "bytes/s", 1_000.0),
            ("queue_depth", "count", 1_000.0),
        ];
        const HOSTS: &[&str] = &["web-01", "web-02", "api-01", "db-01", "cache-01"];

        let (name, unit, scale) = *self.rng.choose(METRICS);
        let value = (self.rng.next_f64() * scale * 100.0).round() / 100.0;

        serde_json::json!({
            "metric_id": seq,
            "name": name,
            "value": value,
            "unit": unit,
            "host": self.rng.choose(HOSTS),
            "tags": {
                "env": self.rng.choose(&["prod", "staging", "dev"]),
                "region": self.rng.choose(&["us-east", "us-west", "eu-west"]),
            },
            "timestamp": now.to_rfc3339(),
        })
    }

    fn key_value(&mut self, seq: u64) -> serde_json::Value {
        serde_json::json!({
            "key": format!("key_{:08}", seq),
            "value": format!("value_{:016x}", self.rng.next_u64()),
        })
    }
}

/// Datagen source connector
#[derive(Debug)]
pub struct DatagenSource {
    name: String,
    topic: String,
    config: DatagenConfig,
    lifecycle: Lifecycle,
    generator: DataGenerator,
    interval: Option<Duration>,
    next_due: Option<Instant>,
    produced: u64,
}

impl DatagenSource {
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        config: DatagenConfig,
    ) -> ConnectorResult<Self> {
        config
            .validate()
            .map_err(|e| ConnectorError::config(format!("invalid datagen config: {}", e)))?;

        let interval = (config.events_per_second > 0)
            .then(|| Duration::from_secs_f64(1.0 / config.events_per_second as f64));

        Ok(Self {
            name: name.into(),
            topic: topic.into(),
            generator: DataGenerator::new(config.clone()),
            config,
            lifecycle: Lifecycle::new(),
            interval,
            next_due: None,
            produced: 0,
        })
    }

    pub fn config(&self) -> &DatagenConfig {
        &self.config
    }

    /// Wait for the next slot of the configured rate
    async fn pace(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            tokio::time::sleep_until(due).await;
        }
        // Fall behind by at most one interval instead of bursting to catch up
        let base = due.max(now.checked_sub(interval).unwrap_or(now));
        self.next_due = Some(base + interval);
    }
}

#[async_trait]
impl SourceConnector for DatagenSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn state(&self) -> ConnectorState {
        self.lifecycle.state()
    }

    fn cursor(&self) -> Option<Cursor> {
        Some(Cursor::from(self.produced))
    }

    async fn connect(&mut self) -> ConnectorResult<()> {
        self.lifecycle.begin_connect()?;
        info!(
            source = %self.name,
            pattern = %self.config.pattern,
            rate = self.config.events_per_second,
            max_events = self.config.max_events,
            "Datagen ready"
        );
        self.lifecycle.mark_connected();
        Ok(())
    }

    async fn produce_next(&mut self) -> ConnectorResult<Produced> {
        self.lifecycle.begin_produce()?;

        if self.config.max_events > 0 && self.produced >= self.config.max_events {
            info!(source = %self.name, "Datagen reached max_events limit: {}", self.config.max_events);
            return Ok(Produced::EndOfStream);
        }

        self.pace().await;

        let (key, data) = self.generator.generate();
        let value = serde_json::to_vec(&data)?;
        let record = Record::new(self.topic.clone(), value)
            .with_key(key)
            .with_offset(self.produced);
        self.produced += 1;
        Ok(Produced::Record(record))
    }

    async fn close(&mut self) {
        if self.lifecycle.close() {
            info!(source = %self.name, produced = self.produced, "Datagen closed");
        }
    }
}

/// Factory for [`DatagenSource`]
pub struct DatagenSourceFactory;

impl SourceFactory for DatagenSourceFactory {
    fn spec(&self) -> ConnectorSpec {
        ConnectorSpec::new("datagen", env!("CARGO_PKG_VERSION"))
            .description("Synthetic record generator for load tests and demos")
            .config_schema::<DatagenConfig>()
    }

    fn create(
        &self,
        name: &str,
        topic: &str,
        config: &serde_yaml::Value,
    ) -> ConnectorResult<Box<dyn SourceConnector>> {
        let config: DatagenConfig = if config.is_null() {
            DatagenConfig::default()
        } else {
            serde_yaml::from_value(config.clone())?
        };
        Ok(Box::new(DatagenSource::new(name, topic, config)?))
    }
}
