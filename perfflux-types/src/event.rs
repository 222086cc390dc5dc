//! Status-interface events (comments, downtimes, notifications).

/// Fields every event carries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EventBase {
    pub host: String,
    /// Empty for host events.
    pub service: String,
    pub time_ms: u64,
    pub author: String,
    pub text: String,
}

/// Kind-specific payload of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "lowercase"))]
pub enum EventKind {
    /// A user or external comment. `entry_type` is the monitoring core's
    /// numeric comment type (user, downtime, flapping, acknowledgement).
    Comment { entry_type: String },

    /// A scheduled downtime.
    Downtime { end_ms: u64 },

    /// A notification sent to a contact.
    Notification {
        notification_type: String,
        state: String,
        command: String,
    },
}

impl EventKind {
    /// Short name used as the event type tag.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Comment { .. } => "comment",
            EventKind::Downtime { .. } => "downtime",
            EventKind::Notification { .. } => "notification",
        }
    }
}

/// An event read from the monitoring core.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EventRecord {
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub base: EventBase,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub kind: EventKind,
}

impl EventRecord {
    pub fn new(base: EventBase, kind: EventKind) -> Self {
        Self { base, kind }
    }

    pub fn comment(base: EventBase, entry_type: impl Into<String>) -> Self {
        Self::new(
            base,
            EventKind::Comment {
                entry_type: entry_type.into(),
            },
        )
    }

    pub fn downtime(base: EventBase, end_ms: u64) -> Self {
        Self::new(base, EventKind::Downtime { end_ms })
    }
}
