use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime};

use crate::model::EntityKind;
use crate::{now_utc, RecordId};

/// Entity id recorded for mutations that touch many records at once.
pub const BULK_ENTITY_ID: &str = "bulk";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Edit,
    Delete,
    Import,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Import => "import",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "edit" => Some(Self::Edit),
            "delete" => Some(Self::Delete),
            "import" => Some(Self::Import),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
}

impl FieldChange {
    pub fn new<T: Serialize + ?Sized>(field: &str, old_value: &T, new_value: &T) -> Self {
        Self {
            field: field.to_string(),
            old_value: serde_json::to_value(old_value).unwrap_or(Value::Null),
            new_value: serde_json::to_value(new_value).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityLogEntry {
    pub id: RecordId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub actor_name: String,
    pub action: ActionKind,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<FieldChange>>,
}

/// Everything about a mutation except its id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewActivity {
    pub actor_name: String,
    pub action: ActionKind,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub detail: String,
    pub changes: Option<Vec<FieldChange>>,
}

/// Optional, AND-combined filters over the activity log. `None` selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityFilter {
    pub from: Option<Date>,
    pub to: Option<Date>,
    pub actor_name: Option<String>,
    pub action: Option<ActionKind>,
    pub entity_kind: Option<EntityKind>,
}

impl ActivityFilter {
    #[must_use]
    pub fn matches(&self, entry: &ActivityLogEntry) -> bool {
        let day = entry.timestamp.date();
        if self.from.is_some_and(|from| day < from) {
            return false;
        }
        if self.to.is_some_and(|to| day > to) {
            return false;
        }
        if let Some(actor) = &self.actor_name {
            if entry.actor_name != *actor {
                return false;
            }
        }
        if self.action.is_some_and(|action| entry.action != action) {
            return false;
        }
        if self
            .entity_kind
            .is_some_and(|kind| entry.entity_kind != kind)
        {
            return false;
        }
        true
    }
}

/// Append-only history of mutations, newest entry first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityLog {
    entries: VecDeque<ActivityLogEntry>,
}

impl ActivityLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from persisted entries in any order.
    #[must_use]
    pub fn from_entries(mut entries: Vec<ActivityLogEntry>) -> Self {
        entries.sort_by(|lhs, rhs| {
            rhs.timestamp
                .cmp(&lhs.timestamp)
                .then_with(|| rhs.id.cmp(&lhs.id))
        });
        Self {
            entries: entries.into(),
        }
    }

    pub fn append(&mut self, id: RecordId, activity: NewActivity) -> &ActivityLogEntry {
        self.entries.push_front(ActivityLogEntry {
            id,
            timestamp: now_utc(),
            actor_name: activity.actor_name,
            action: activity.action,
            entity_kind: activity.entity_kind,
            entity_id: activity.entity_id,
            detail: activity.detail,
            changes: activity.changes,
        });
        &self.entries[0]
    }

    pub fn entries(&self) -> impl Iterator<Item = &ActivityLogEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&ActivityLogEntry> {
        self.entries.front()
    }

    #[must_use]
    pub fn query(&self, filter: &ActivityFilter) -> Vec<&ActivityLogEntry> {
        self.entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .collect()
    }

    /// Drops every entry and returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the whole log, newest first.
    ///
    /// # Errors
    /// Returns the underlying serializer error.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.entries)
    }
}
