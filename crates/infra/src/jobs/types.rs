//! Job record, priority lanes and the job-level retry delay
//!
//! Wire format (JSON):
//!
//! ```json
//! {
//!   "id": "0192a0c4-...",
//!   "type": "provision",
//!   "priority": 3,
//!   "payload": { "wallet_id": "w-1" },
//!   "retries": 0,
//!   "max_retries": 3,
//!   "created_at": "2026-10-15T09:00:00Z",
//!   "scheduled_at": "2026-10-15T09:00:10Z"
//! }
//! ```
//!
//! `priority` is a small integer (0 = Low .. 3 = Critical) and `scheduled_at`
//! is omitted when unset.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use stack_common::duration_millis;
use uuid::Uuid;

/// Payload key written by [`super::JobQueue::move_to_dead_letter`]
pub const FAILURE_REASON_KEY: &str = "failure_reason";

/// Dead-letter reason once `retries` reaches `max_retries`
pub const MAX_RETRIES_EXCEEDED: &str = "max retries exceeded";

/// Dead-letter reason for a job type nobody handles
pub const NO_HANDLER_FOUND: &str = "no handler found";

/// Free-form job arguments
pub type Payload = Map<String, Value>;

/// Priority lane of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

stack_common::impl_label_conversions!(Priority {
    Low => "low",
    Normal => "normal",
    High => "high",
    Critical => "critical",
});

impl Priority {
    /// Scan order used by workers: Critical, High, Normal, Low
    pub const ALL_DESC: [Self; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            3 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Storage key of this priority's FIFO list
    pub const fn queue_key(self) -> &'static str {
        match self {
            Self::Low => "queue:low",
            Self::Normal => "queue:normal",
            Self::High => "queue:high",
            Self::Critical => "queue:critical",
        }
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        Self::from_u8(value).ok_or_else(|| {
            serde::de::Error::custom(format!("priority must be between 0 and 3, got {value}"))
        })
    }
}

/// Unit of background work
///
/// `max_retries == 0` and `created_at == None` mean "unset"; the queue fills
/// both on enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// New job with a time-ordered id and unset defaults
    pub fn new(job_type: impl Into<String>, priority: Priority, payload: Payload) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            job_type: job_type.into(),
            priority,
            payload,
            retries: 0,
            max_retries: 0,
            created_at: None,
            scheduled_at: None,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Defer the job until `at`
    #[must_use]
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_payload_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Reason recorded when the job was dead-lettered
    pub fn failure_reason(&self) -> Option<&str> {
        self.payload.get(FAILURE_REASON_KEY).and_then(Value::as_str)
    }

    /// True once another failure would dead-letter the job
    pub const fn is_last_attempt(&self) -> bool {
        self.retries.saturating_add(1) >= self.max_retries
    }
}

/// Delay before a failed job becomes visible again
///
/// Kept apart from `RetryPolicy`: job retries run on a coarser timescale than
/// per-call retries and carry no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobBackoff {
    /// `unit * retries^2`
    Quadratic {
        #[serde(with = "duration_millis")]
        unit: Duration,
    },
    /// The same delay after every failure
    Fixed {
        #[serde(with = "duration_millis")]
        delay: Duration,
    },
}

impl Default for JobBackoff {
    fn default() -> Self {
        Self::Quadratic { unit: Duration::from_secs(1) }
    }
}

impl JobBackoff {
    /// Delay after the `retries`-th failure
    pub fn delay(&self, retries: u32) -> Duration {
        match self {
            Self::Quadratic { unit } => unit.saturating_mul(retries.saturating_mul(retries)),
            Self::Fixed { delay } => *delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_serializes_as_small_integer() {
        let json = serde_json::to_string(&Priority::Critical).expect("serialize");
        assert_eq!(json, "3");
        let parsed: Priority = serde_json::from_str("0").expect("deserialize");
        assert_eq!(parsed, Priority::Low);
        assert!(serde_json::from_str::<Priority>("4").is_err());
    }

    #[test]
    fn priority_keys_and_labels() {
        assert_eq!(Priority::Normal.queue_key(), "queue:normal");
        assert_eq!(Priority::High.to_string(), "high");
        assert_eq!("CRITICAL".parse::<Priority>(), Ok(Priority::Critical));
        assert!(Priority::Critical > Priority::Low);
    }

    #[test]
    fn job_wire_format_uses_type_and_omits_unset_schedule() {
        let job = Job::new("provision", Priority::High, Payload::new())
            .with_payload_value("wallet_id", "w-1");
        let value = serde_json::to_value(&job).expect("serialize");

        assert_eq!(value["type"], "provision");
        assert_eq!(value["priority"], 2);
        assert_eq!(value["payload"]["wallet_id"], "w-1");
        assert!(value.get("scheduled_at").is_none());

        let back: Job = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, job);
    }

    #[test]
    fn job_accepts_minimal_records() {
        let job: Job = serde_json::from_str(r#"{"type":"noop"}"#).expect("minimal job");
        assert!(job.id.is_empty());
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.max_retries, 0);
        assert!(job.created_at.is_none());
    }

    #[test]
    fn quadratic_backoff_squares_retries() {
        let backoff = JobBackoff::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(3), Duration::from_secs(9));

        let fixed = JobBackoff::Fixed { delay: Duration::from_secs(30) };
        assert_eq!(fixed.delay(7), Duration::from_secs(30));
    }

    #[test]
    fn job_backoff_config_shape() {
        let parsed: JobBackoff =
            serde_json::from_str(r#"{"kind":"quadratic","unit":500}"#).expect("backoff");
        assert_eq!(parsed, JobBackoff::Quadratic { unit: Duration::from_millis(500) });
    }
}
