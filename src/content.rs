//! Content records and their completeness lifecycle.
//!
//! A record is an opaque JSON tree produced by the remote API or the local
//! store. The only structure the pipeline relies on is the `meta` object:
//! a completeness flag and, while a translation job is running, a cron key.

use crate::error::ContentError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

/// The content kinds known to the pipeline.
///
/// Each kind owns one partition of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentKind {
    Interface,
    CommonContent,
    LessonContent,
    SiteContent,
    Notes,
    StudyProgress,
}

impl ContentKind {
    pub const ALL: [ContentKind; 6] = [
        ContentKind::SiteContent,
        ContentKind::CommonContent,
        ContentKind::LessonContent,
        ContentKind::Interface,
        ContentKind::Notes,
        ContentKind::StudyProgress,
    ];

    /// Name of the store partition backing this kind.
    pub fn partition(&self) -> &'static str {
        match self {
            ContentKind::Interface => "interface",
            ContentKind::CommonContent => "commonContent",
            ContentKind::LessonContent => "lessonContent",
            ContentKind::SiteContent => "siteContent",
            ContentKind::Notes => "notes",
            ContentKind::StudyProgress => "study_progress",
        }
    }

    /// Whether the backend runs translation jobs for this kind.
    pub fn is_translatable(&self) -> bool {
        !matches!(self, ContentKind::Notes | ContentKind::StudyProgress)
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.partition())
    }
}

impl FromStr for ContentKind {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.partition() == s.trim())
            .ok_or_else(|| ContentError::UnsupportedKind(s.to_string()))
    }
}

/// Derived completeness of a (possibly absent) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Absent,
    Partial,
    Complete,
}

impl Completeness {
    pub fn of(record: Option<&ContentRecord>) -> Self {
        match record {
            None => Completeness::Absent,
            Some(r) if r.is_complete() => Completeness::Complete,
            Some(_) => Completeness::Partial,
        }
    }
}

/// A content payload for one (kind, identity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRecord(Value);

impl ContentRecord {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Stub handed to UI code when nothing could be loaded.
    pub fn fallback_stub() -> Self {
        Self(json!({ "meta": { "complete": false } }))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.0.as_object()
    }

    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.0.get("meta").and_then(Value::as_object)
    }

    /// `meta.complete == true`, or the older `meta.translationComplete`.
    pub fn is_complete(&self) -> bool {
        self.meta().is_some_and(|meta| {
            meta.get("complete") == Some(&Value::Bool(true))
                || meta.get("translationComplete") == Some(&Value::Bool(true))
        })
    }

    /// The job continuation token, if the backend issued a non-blank one.
    pub fn cron_key(&self) -> Option<String> {
        let raw = self.meta()?.get("cronKey")?;
        let key = match raw {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!key.is_empty()).then_some(key)
    }

    pub fn completeness(&self) -> Completeness {
        Completeness::of(Some(self))
    }
}

impl From<Value> for ContentRecord {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
