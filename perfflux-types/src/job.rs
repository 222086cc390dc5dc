//! The unit of work handed to backend workers.

use crate::{EventRecord, MetricPoint};

/// A job queued for a backend target.
///
/// Each job is consumed by exactly one worker of the target it was queued
/// for. `Raw` carries text that is already in the backend's wire format
/// (replayed spill files) and is passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DispatchJob {
    Point(MetricPoint),
    Raw(String),
    Event(EventRecord),
}

impl DispatchJob {
    pub fn is_point(&self) -> bool {
        matches!(self, DispatchJob::Point(_))
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, DispatchJob::Raw(_))
    }
}

impl From<MetricPoint> for DispatchJob {
    fn from(point: MetricPoint) -> Self {
        DispatchJob::Point(point)
    }
}

impl From<EventRecord> for DispatchJob {
    fn from(event: EventRecord) -> Self {
        DispatchJob::Event(event)
    }
}

impl From<String> for DispatchJob {
    fn from(raw: String) -> Self {
        DispatchJob::Raw(raw)
    }
}
