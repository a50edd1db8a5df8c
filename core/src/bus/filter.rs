//! Event filters: predicate specs matched against immutable event fields.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Map;
use serde_json::Value;

use super::Event;

/// Match on the event type, either exactly or by regular expression.
#[derive(Debug, Clone)]
pub enum TypeFilter {
    Exact(String),
    Pattern(Regex),
}

impl TypeFilter {
    fn matches(&self, event_type: &str) -> bool {
        match self {
            TypeFilter::Exact(t) => t == event_type,
            TypeFilter::Pattern(re) => re.is_match(event_type),
        }
    }
}

impl From<&str> for TypeFilter {
    fn from(t: &str) -> Self {
        TypeFilter::Exact(t.to_string())
    }
}

impl From<String> for TypeFilter {
    fn from(t: String) -> Self {
        TypeFilter::Exact(t)
    }
}

impl From<Regex> for TypeFilter {
    fn from(re: Regex) -> Self {
        TypeFilter::Pattern(re)
    }
}

/// Predicate over stored and future events. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<TypeFilter>,
    pub correlation_id: Option<String>,
    pub source_id: Option<String>,
    pub timestamp_from: Option<DateTime<Utc>>,
    pub timestamp_to: Option<DateTime<Utc>>,
    /// Exact-match subset of the event metadata.
    pub metadata: Option<Map<String, Value>>,
}

impl EventFilter {
    pub fn for_type(t: impl Into<TypeFilter>) -> Self {
        Self {
            event_type: Some(t.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(tf) = &self.event_type {
            if !tf.matches(&event.event_type) {
                return false;
            }
        }

        if let Some(cid) = &self.correlation_id {
            if event.correlation_id.as_ref() != Some(cid) {
                return false;
            }
        }

        if let Some(sid) = &self.source_id {
            if event.source_id.as_ref() != Some(sid) {
                return false;
            }
        }

        if let Some(from) = self.timestamp_from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.timestamp_to {
            if event.timestamp > to {
                return false;
            }
        }

        if let Some(wanted) = &self.metadata {
            let Some(meta) = &event.metadata else {
                return false;
            };
            for (key, value) in wanted {
                if meta.get(key) != Some(value) {
                    return false;
                }
            }
        }

        true
    }
}
