//! Log event types shipped to CloudWatch Logs.
//!
//! A [`LogEvent`] is the unit the service accepts: a millisecond timestamp and an
//! already-serialized message. [`LogRecord`] is the structured, levelled payload
//! the application-facing helpers serialize into that message.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Fixed per-event overhead the service adds when sizing a batch.
pub const EVENT_OVERHEAD_BYTES: usize = 26;

/// A single log event as accepted by `PutLogEvents`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Serialized payload
    pub message: String,
}

impl LogEvent {
    /// Create an event stamped with the current time.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            message: message.into(),
        }
    }

    /// Create an event with an explicit timestamp.
    pub fn at(timestamp: i64, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
        }
    }

    /// Serialize `data` as JSON and wrap it in an event stamped now.
    pub fn from_json<T: Serialize + ?Sized>(data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_string(data)?))
    }

    /// Size this event counts against the batch byte quota.
    pub fn billed_size(&self) -> usize {
        self.message.len() + EVENT_OVERHEAD_BYTES
    }
}

/// Severity of a structured [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Critical,
    Error,
    Security,
    Warning,
    Info,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Critical => write!(f, "Critical"),
            Level::Error => write!(f, "Error"),
            Level::Security => write!(f, "Security"),
            Level::Warning => write!(f, "Warning"),
            Level::Info => write!(f, "Info"),
        }
    }
}

/// A structured application log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub level: Level,

    pub message: String,

    /// Stack trace or call site, empty when not applicable
    #[serde(default)]
    pub stack: String,

    /// Identifier tying related records together across services
    #[serde(default)]
    pub correlation_id: String,

    /// Query text attached to informational records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl LogRecord {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            stack: String::new(),
            correlation_id: String::new(),
            query: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Convert into a [`LogEvent`] stamped now.
    pub fn to_event(&self) -> Result<LogEvent, serde_json::Error> {
        LogEvent::from_json(self)
    }
}
