//! The `list` subcommand: recent run summaries.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::state::AppState;

use super::{human_duration, run_status_cell};

pub async fn handle_list(
    state: &AppState,
    workflow: Option<&str>,
    limit: u32,
    json: bool,
) -> anyhow::Result<()> {
    let runs = state.engine.list(workflow, limit).await?;

    if json {
        let out: Vec<_> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "run_id": r.run_id,
                    "workflow_name": r.workflow_name,
                    "workflow_version": r.workflow_version,
                    "status": r.status,
                    "start_time": r.start_time.to_rfc3339(),
                    "end_time": r.end_time.map(|t| t.to_rfc3339()),
                    "duration": human_duration(r.start_time, r.end_time),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        match workflow {
            Some(name) => println!("  No runs recorded for workflow '{name}'."),
            None => println!("  No runs recorded."),
        }
        println!(
            "  Start one with: {}",
            style("bioflow run <workflow.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Version"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Duration"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(&r.run_id),
            Cell::new(&r.workflow_name),
            Cell::new(&r.workflow_version),
            run_status_cell(r.status),
            Cell::new(r.start_time.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(human_duration(r.start_time, r.end_time)),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}
