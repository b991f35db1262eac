//! The `run` subcommand: execute a workflow file end to end.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use bioflow_core::execution::engine::{EngineConfig, RunOptions};
use bioflow_core::workflow::dag;
use bioflow_core::workflow::definition::load_workflow_file;
use bioflow_core::workflow::duration::parse_duration;
use bioflow_types::run::RunStatus;
use bioflow_types::workflow::WorkflowDefinition;

use crate::state::AppState;

use super::step_status_cell;

/// Parsed arguments for `bioflow run`.
pub struct RunArgs {
    pub workflow_file: PathBuf,
    pub inputs: Vec<String>,
    pub parallel: usize,
    pub default_time_limit: String,
    pub disable_time_limits: bool,
    pub base_dir: PathBuf,
    pub dry_run: bool,
}

/// Execute (or dry-run) a workflow file. Returns the process exit code:
/// 0 COMPLETED, 1 FAILED/ERROR, 2 invalid workflow, 130 cancelled.
pub async fn handle_run(args: RunArgs, json: bool) -> anyhow::Result<ExitCode> {
    // Invalid definitions exit 2 before any run is created.
    let def = match load_workflow_file(&args.workflow_file) {
        Ok(def) => def,
        Err(e) => {
            eprintln!("Invalid workflow: {e}");
            return Ok(ExitCode::from(2));
        }
    };

    let default_limit = match parse_duration(&args.default_time_limit) {
        Ok(secs) => std::time::Duration::from_secs(secs),
        Err(e) => {
            eprintln!("Invalid --default-time-limit: {e}");
            return Ok(ExitCode::from(2));
        }
    };

    if args.dry_run {
        print_plan(&def, json)?;
        return Ok(ExitCode::SUCCESS);
    }

    let input_overrides = parse_input_overrides(&args.inputs)?;

    let mut config = EngineConfig::new(args.base_dir);
    config.default_time_limit = default_limit;
    config.disable_time_limits = args.disable_time_limits;
    let state = AppState::init_with(config).await?;

    // Ctrl-C trips the engine's cancel signal; the run then settles and
    // reports as cancelled.
    let cancel_engine = state.engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_engine.cancel_all();
        }
    });

    if !json {
        println!();
        println!(
            "  Executing workflow {} {} with {} step(s), parallel {}",
            style(&def.name).cyan(),
            style(format!("v{}", def.version)).green(),
            def.steps.len(),
            args.parallel
        );
    }

    let outcome = state
        .engine
        .run(
            &def,
            RunOptions {
                inputs: input_overrides,
                parallel: args.parallel,
                run_id: None,
            },
        )
        .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    if json {
        let out = serde_json::json!({
            "run_id": outcome.run_id,
            "status": outcome.status,
            "run_dir": outcome.run_dir.display().to_string(),
            "cancelled": outcome.cancelled,
            "steps": outcome.steps,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_outcome(&outcome);
    }

    Ok(match outcome.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        _ if outcome.cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    })
}

/// `key=value` pairs from repeated `--input` flags.
fn parse_input_overrides(inputs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for item in inputs {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("invalid --input '{item}', expected key=value"))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Dry-run output: workflow info plus the execution plan.
fn print_plan(def: &WorkflowDefinition, json: bool) -> anyhow::Result<()> {
    let order = dag::execution_order(def)?;

    if json {
        let out = serde_json::json!({
            "name": def.name,
            "version": def.version,
            "steps": def.steps.len(),
            "execution_order": order,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {} Dry run -- nothing will execute", style("*").yellow().bold());
    println!("  Workflow: {} v{}", style(&def.name).cyan(), def.version);
    if let Some(desc) = &def.description {
        println!("  {desc}");
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#"),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Container"),
            Cell::new("Dependencies"),
            Cell::new("Time Limit"),
        ]);

    for (i, name) in order.iter().enumerate() {
        let step = &def.steps[name.as_str()];
        let deps = if step.after.is_empty() {
            "-".to_string()
        } else {
            step.after.join(", ")
        };
        let limit = step
            .resources
            .time_limit
            .clone()
            .unwrap_or_else(|| "default".to_string());

        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(name),
            Cell::new(&step.container),
            Cell::new(deps),
            Cell::new(limit),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

fn print_outcome(outcome: &bioflow_core::execution::engine::RunOutcome) {
    println!();
    match outcome.status {
        RunStatus::Completed => {
            println!("  {} Run completed", style("*").green().bold());
        }
        _ if outcome.cancelled => {
            println!("  {} Run cancelled", style("*").yellow().bold());
        }
        _ => {
            println!("  {} Run finished as {}", style("*").red().bold(), outcome.status);
        }
    }
    println!("  Run ID: {}", style(&outcome.run_id).cyan());
    println!("  Run directory: {}", outcome.run_dir.display());
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Exit"),
            Cell::new("Outputs"),
            Cell::new("Error"),
        ]);

    for (name, snapshot) in &outcome.steps {
        let exit = snapshot
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let error = snapshot
            .error
            .as_deref()
            .map(|e| e.chars().take(48).collect::<String>())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(name),
            step_status_cell(snapshot.status),
            Cell::new(exit),
            Cell::new(snapshot.outputs.len()),
            Cell::new(error),
        ]);
    }

    println!("{table}");
    println!();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input_overrides() {
        let parsed =
            parse_input_overrides(&["reads=data/a.fastq".to_string(), "ref=hg38".to_string()])
                .unwrap();
        assert_eq!(parsed["reads"], "data/a.fastq");
        assert_eq!(parsed["ref"], "hg38");
    }

    #[test]
    fn test_parse_input_override_keeps_equals_in_value() {
        let parsed = parse_input_overrides(&["expr=a=b".to_string()]).unwrap();
        assert_eq!(parsed["expr"], "a=b");
    }

    #[test]
    fn test_parse_input_override_rejects_missing_equals() {
        assert!(parse_input_overrides(&["oops".to_string()]).is_err());
    }
}
