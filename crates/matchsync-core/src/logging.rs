//! Per-device JSONL logging.
//!
//! Several simulated devices often run in one process (tests, the CLI
//! scenarios). Each gets its own append-only file so their timelines can be
//! read separately or merged with `jq`:
//!
//! ```text
//! logs/
//! ├── 2026-10-14_alice-phone.jsonl
//! └── 2026-10-14_bob-tablet.jsonl
//! ```
//!
//! ```bash
//! # Every queue flush across devices, in time order
//! cat logs/*.jsonl | jq -s 'sort_by(.ts) | .[] | select(.msg == "Offline queue flushed")'
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

/// One line of a device log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 with milliseconds
    pub ts: String,
    pub level: String,
    pub device: String,
    pub target: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

struct DeviceLogWriter {
    device: String,
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl DeviceLogWriter {
    fn open(logs_dir: &Path, device: String) -> std::io::Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = logs_dir.join(format!("{}_{}.jsonl", date, device));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            device,
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    fn append(&self, entry: &LogEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = self.file.lock();
        writeln!(file, "{}", line)?;
        file.flush()
    }
}

/// A `tracing` layer that appends every event to the device's JSONL file.
#[derive(Clone)]
pub struct JsonlLayer {
    writer: Arc<DeviceLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, device: impl Into<String>) -> std::io::Result<Self> {
        let writer = DeviceLogWriter::open(logs_dir.as_ref(), device.into())?;
        Ok(Self {
            writer: Arc::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.writer.path
    }

    pub fn device(&self) -> &str {
        &self.writer.device
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let span = ctx.event_scope(event).map(|scope| {
            scope
                .from_root()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(" > ")
        });

        let entry = LogEntry {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: meta.level().as_str().to_lowercase(),
            device: self.writer.device.clone(),
            target: meta.target().to_string(),
            msg: fields.message.unwrap_or_default(),
            fields: fields.values,
            span: span.filter(|s| !s.is_empty()),
        };
        // A failing log sink must never take the sync layer down.
        let _ = self.writer.append(&entry);
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.values.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}

/// Filter for a `-v` count: 0 → warn, 1 → info, 2 → debug, more → trace.
///
/// `RUST_LOG` wins when set.
pub fn env_filter(verbosity: u8) -> EnvFilter {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("matchsync_core={level},matchsync={level}")))
}

/// Install a console subscriber. Returns `false` if one was already set.
pub fn init_console(verbosity: u8) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(verbosity))
        .with(tracing_subscriber::fmt::layer().with_target(verbosity > 1))
        .try_init()
        .is_ok()
}

/// Install console output plus a JSONL file for `device`.
pub fn init_with_jsonl(
    logs_dir: impl AsRef<Path>,
    device: impl Into<String>,
    verbosity: u8,
) -> std::io::Result<JsonlLayer> {
    let layer = JsonlLayer::new(logs_dir, device)?;
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbosity))
        .with(tracing_subscriber::fmt::layer().with_target(verbosity > 1))
        .with(layer.clone())
        .try_init();
    Ok(layer)
}

/// Read back a device log, skipping lines that do not parse.
pub fn read_entries(path: impl AsRef<Path>) -> std::io::Result<Vec<LogEntry>> {
    let file = File::open(path)?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Ok(entry) = serde_json::from_str(&line) {
            entries.push(entry);
        }
    }
    Ok(entries)
}
