//! Teardown bookkeeping
//!
//! Teardown is a fixed sequence of best-effort steps. A failing step is
//! logged and recorded, and the remaining steps still run.

use crate::command::DispatchStats;
use robofleet_shared::{timing, RobotId};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error};

/// Grace periods used while closing a session
#[derive(Debug, Clone)]
pub struct TeardownConfig {
    /// Time an in-flight detection gets before the analyzer is aborted
    pub analysis_grace: Duration,
    /// Time the command worker gets to publish the final STOP and drain
    pub stop_grace: Duration,
    /// Pause after leaving the video channel
    pub video_flush_grace: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            analysis_grace: Duration::from_millis(timing::ANALYSIS_STOP_GRACE_MS),
            stop_grace: Duration::from_millis(timing::STOP_GRACE_MS),
            video_flush_grace: Duration::from_millis(timing::VIDEO_FLUSH_GRACE_MS),
        }
    }
}

/// Teardown steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    StopAnalysis,
    FinalStop,
    LeaveVideo,
    DestroyVideo,
    PublishReleased,
    Disconnect,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownStep::StopAnalysis => "stop analysis",
            TeardownStep::FinalStop => "final STOP",
            TeardownStep::LeaveVideo => "leave video",
            TeardownStep::DestroyVideo => "destroy video",
            TeardownStep::PublishReleased => "publish released status",
            TeardownStep::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Failed(String),
}

/// What happened during a session's teardown
#[derive(Debug, Clone)]
pub struct TeardownReport {
    pub robot_id: RobotId,
    pub steps: Vec<(TeardownStep, StepOutcome)>,
    /// Command worker counters, if it drained in time
    pub dispatch: Option<DispatchStats>,
}

impl TeardownReport {
    pub fn new(robot_id: RobotId) -> Self {
        Self {
            robot_id,
            steps: Vec::new(),
            dispatch: None,
        }
    }

    /// Record the result of a step
    pub fn record(&mut self, step: TeardownStep, result: anyhow::Result<()>) {
        let outcome = match result {
            Ok(()) => {
                debug!("[SESSION {}] Teardown: {} done", self.robot_id, step);
                StepOutcome::Done
            }
            Err(e) => {
                error!("[SESSION {}] Teardown: {} failed: {}", self.robot_id, step, e);
                StepOutcome::Failed(e.to_string())
            }
        };
        self.steps.push((step, outcome));
    }

    pub fn outcome(&self, step: TeardownStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, o)| o)
    }

    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|(_, o)| *o == StepOutcome::Done)
    }

    pub fn failed_steps(&self) -> Vec<TeardownStep> {
        self.steps
            .iter()
            .filter(|(_, o)| *o != StepOutcome::Done)
            .map(|(s, _)| *s)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_report_tracks_failures() {
        let mut report = TeardownReport::new(1);
        report.record(TeardownStep::StopAnalysis, Ok(()));
        report.record(TeardownStep::LeaveVideo, Err(anyhow!("engine gone")));
        report.record(TeardownStep::Disconnect, Ok(()));

        assert!(!report.is_clean());
        assert_eq!(report.failed_steps(), vec![TeardownStep::LeaveVideo]);
        assert_eq!(
            report.outcome(TeardownStep::LeaveVideo),
            Some(&StepOutcome::Failed("engine gone".into()))
        );
        assert_eq!(report.outcome(TeardownStep::FinalStop), None);
    }

    #[test]
    fn test_default_grace_periods() {
        let config = TeardownConfig::default();
        assert_eq!(config.stop_grace, Duration::from_millis(200));
        assert_eq!(config.video_flush_grace, Duration::from_millis(200));
    }
}
