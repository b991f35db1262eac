//! CLI command handlers.

pub mod init;
pub mod list;
pub mod run;
pub mod status;

use bioflow_types::run::{RunStatus, StepStatus};
use comfy_table::{Cell, Color};

/// Styled status cell for run summaries.
pub(crate) fn run_status_cell(status: RunStatus) -> Cell {
    match status {
        RunStatus::Pending => Cell::new("PENDING").fg(Color::Yellow),
        RunStatus::Running => Cell::new("RUNNING").fg(Color::Blue),
        RunStatus::Completed => Cell::new("COMPLETED").fg(Color::Green),
        RunStatus::Failed => Cell::new("FAILED").fg(Color::Red),
        RunStatus::Error => Cell::new("ERROR").fg(Color::Red),
    }
}

/// Styled status cell for step rows.
pub(crate) fn step_status_cell(status: StepStatus) -> Cell {
    match status {
        StepStatus::Pending => Cell::new("PENDING").fg(Color::Yellow),
        StepStatus::Running => Cell::new("RUNNING").fg(Color::Blue),
        StepStatus::Completed => Cell::new("COMPLETED").fg(Color::Green),
        StepStatus::Failed => Cell::new("FAILED").fg(Color::Red),
        StepStatus::Error => Cell::new("ERROR").fg(Color::Red),
        StepStatus::TerminatedTimeLimit => Cell::new("TERMINATED_TIME_LIMIT").fg(Color::DarkYellow),
        StepStatus::Skipped => Cell::new("SKIPPED").fg(Color::DarkGrey),
    }
}

/// Render an elapsed interval for display.
pub(crate) fn human_duration(
    start: chrono::DateTime<chrono::Utc>,
    end: Option<chrono::DateTime<chrono::Utc>>,
) -> String {
    match end {
        Some(end) => {
            let secs = (end - start).num_seconds().max(0) as u64;
            bioflow_core::workflow::duration::format_duration(secs)
        }
        None => "-".to_string(),
    }
}
