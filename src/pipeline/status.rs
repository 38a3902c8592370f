//! Operator-facing pipeline status.

use crate::checkpoint::CheckpointStatus;
use crate::event::Position;
use crate::router::SinkId;
use crate::sink::{SinkHealth, SinkStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelinePhase {
    Starting,
    Running,
    Paused,
    /// Running, but at least one sink stopped accepting events.
    Degraded,
    Failed,
    Stopped,
}

impl PipelinePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelinePhase::Failed | PipelinePhase::Stopped)
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelinePhase::Starting => "STARTING",
            PipelinePhase::Running => "RUNNING",
            PipelinePhase::Paused => "PAUSED",
            PipelinePhase::Degraded => "DEGRADED",
            PipelinePhase::Failed => "FAILED",
            PipelinePhase::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// One sink's status plus how far it trails the source head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkLag {
    #[serde(flatten)]
    pub status: SinkStatus,
    pub lag: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub pipeline_id: String,
    pub phase: PipelinePhase,
    pub reason: Option<String>,
    pub head_position: Option<Position>,
    pub last_confirmed_position: Option<Position>,
    pub highest_dispatched: Option<Position>,
    /// Positions between the source head and the last confirmed checkpoint.
    pub lag: Option<u64>,
    pub degraded_sinks: Vec<SinkId>,
    pub sinks: Vec<SinkLag>,
    pub checkpoint: Option<CheckpointStatus>,
    pub records_read: u64,
    pub events_decoded: u64,
    pub records_skipped: u64,
    pub events_unrouted: u64,
    pub source_reconnects: u64,
    pub lease_epoch: Option<u64>,
}

impl PipelineStatus {
    pub fn starting(pipeline_id: impl Into<String>) -> Self {
        PipelineStatus {
            pipeline_id: pipeline_id.into(),
            phase: PipelinePhase::Starting,
            reason: None,
            head_position: None,
            last_confirmed_position: None,
            highest_dispatched: None,
            lag: None,
            degraded_sinks: Vec::new(),
            sinks: Vec::new(),
            checkpoint: None,
            records_read: 0,
            events_decoded: 0,
            records_skipped: 0,
            events_unrouted: 0,
            source_reconnects: 0,
            lease_epoch: None,
        }
    }

    pub fn sink(&self, id: &SinkId) -> Option<&SinkLag> {
        self.sinks.iter().find(|s| &s.status.id == id)
    }

    pub fn sink_health(&self, id: &SinkId) -> Option<SinkHealth> {
        self.sink(id).map(|s| s.status.health)
    }

    /// Whether the last confirmed checkpoint covers `position`.
    pub fn confirmed_through(&self, position: Position) -> bool {
        self.last_confirmed_position.map_or(false, |p| p >= position)
    }

    pub fn stalled(&self) -> bool {
        self.checkpoint.as_ref().map_or(false, |c| c.stalled)
    }
}

/// Distance from `behind` up to `head`, counting an unset `behind` as
/// everything up to the head.
pub fn lag(head: Option<Position>, behind: Option<Position>) -> Option<u64> {
    let head = head?;
    Some(match behind {
        Some(p) => head.0.saturating_sub(p.0),
        None => head.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lag() {
        assert_eq!(lag(None, Some(Position(3))), None);
        assert_eq!(lag(Some(Position(10)), Some(Position(4))), Some(6));
        assert_eq!(lag(Some(Position(10)), None), Some(10));
        assert_eq!(lag(Some(Position(3)), Some(Position(5))), Some(0));
    }

    #[test]
    fn test_phase_display_and_serde() {
        assert_eq!(PipelinePhase::Degraded.to_string(), "DEGRADED");
        let json = serde_json::to_string(&PipelinePhase::Stopped).unwrap();
        assert_eq!(json, "\"STOPPED\"");
        assert!(PipelinePhase::Failed.is_terminal());
        assert!(!PipelinePhase::Paused.is_terminal());
    }

    #[test]
    fn test_confirmed_through() {
        let mut status = PipelineStatus::starting("p");
        assert!(!status.confirmed_through(Position(1)));
        status.last_confirmed_position = Some(Position(12));
        assert!(status.confirmed_through(Position(12)));
        assert!(!status.confirmed_through(Position(13)));
    }
}
