//! The `status` subcommand: run detail with per-step state.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::state::AppState;

use super::{human_duration, step_status_cell};

pub async fn handle_status(state: &AppState, run_id: &str, json: bool) -> anyhow::Result<()> {
    let (run, steps) = state.engine.status(run_id).await?;

    if json {
        let out = serde_json::json!({
            "run_id": run.run_id,
            "workflow_name": run.workflow_name,
            "workflow_version": run.workflow_version,
            "status": run.status,
            "start_time": run.start_time.to_rfc3339(),
            "end_time": run.end_time.map(|t| t.to_rfc3339()),
            "run_dir": run.run_dir,
            "inputs": run.inputs,
            "error": run.error,
            "steps": steps,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  Run {} -- {} {}",
        style(&run.run_id).cyan(),
        style(&run.workflow_name).cyan(),
        style(format!("v{}", run.workflow_version)).green()
    );
    println!("  Status: {}", run.status);
    println!("  Started: {}", run.start_time.format("%Y-%m-%d %H:%M:%S"));
    if let Some(end) = run.end_time {
        println!("  Ended: {}", end.format("%Y-%m-%d %H:%M:%S"));
        println!("  Duration: {}", human_duration(run.start_time, Some(end)));
    }
    println!("  Run directory: {}", run.run_dir);
    if let Some(error) = &run.error {
        println!("  Error: {}", style(error).red());
    }
    println!();

    if steps.is_empty() {
        println!("  No step executions recorded.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempt"),
            Cell::new("Started"),
            Cell::new("Duration"),
            Cell::new("Exit"),
            Cell::new("Log"),
        ]);

    for s in &steps {
        let started = s
            .start_time
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let duration = s
            .start_time
            .map(|start| human_duration(start, s.end_time))
            .unwrap_or_else(|| "-".to_string());
        let exit = s
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(&s.step_name),
            step_status_cell(s.status),
            Cell::new(s.attempt),
            Cell::new(started),
            Cell::new(duration),
            Cell::new(exit),
            Cell::new(s.log_file.as_deref().unwrap_or("-")),
        ]);
    }

    println!("{table}");
    println!();

    Ok(())
}
