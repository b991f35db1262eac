//! The `init` subcommand: write a starter workflow file.

use std::path::{Path, PathBuf};

use anyhow::bail;
use console::style;

use bioflow_core::workflow::definition::workflow_template;

pub fn handle_init(name: &str, output: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(format!("{name}.yaml")));

    if path.exists() {
        bail!("refusing to overwrite existing file: {}", path.display());
    }

    std::fs::write(&path, workflow_template(name))?;

    if json {
        println!(
            "{}",
            serde_json::json!({"created": path.display().to_string(), "name": name})
        );
    } else {
        println!();
        println!(
            "  {} Wrote template workflow to {}",
            style("*").green().bold(),
            style(path.display()).cyan()
        );
        println!(
            "  Run it with: {}",
            style(format!("bioflow run {}", path.display())).dim()
        );
        println!();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bioflow_core::workflow::definition::load_workflow_file;

    #[test]
    fn test_init_writes_valid_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.yaml");

        handle_init("demo", Some(&path), true).unwrap();

        let def = load_workflow_file(&path).expect("template should validate");
        assert_eq!(def.name, "demo");
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.yaml");
        std::fs::write(&path, "existing").unwrap();

        assert!(handle_init("demo", Some(&path), true).is_err());
    }
}
