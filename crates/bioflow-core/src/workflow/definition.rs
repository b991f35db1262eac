//! Workflow document parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and the canonical `WorkflowDefinition` IR and
//! validates structural constraints: name/version format, step completeness,
//! resource formats, dependency existence, and acyclicity. A definition that
//! fails validation never produces a run.

use std::path::Path;

use bioflow_types::workflow::WorkflowDefinition;
use thiserror::Error;

use super::dag;
use super::duration::parse_duration;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a workflow document.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML deserialization failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// A time-limit string could not be parsed.
    #[error("invalid duration: '{0}'")]
    InvalidDuration(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file, creating parent directories.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_workflow_yaml(def)?)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty, alphanumeric plus `_` and `-`
/// - Version is `MAJOR.MINOR.PATCH`
/// - At least one step exists
/// - Every step has a container image and a command
/// - `resources.memory` matches `<number><M|G|T>`
/// - `resources.time_limit` parses as a duration when present
/// - All `after` references resolve and the graph is acyclic
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(WorkflowError::ValidationError(format!(
            "invalid workflow name '{}' (only alphanumeric characters, underscores, and hyphens allowed)",
            def.name
        )));
    }

    if !is_semver(&def.version) {
        return Err(WorkflowError::ValidationError(format!(
            "invalid version '{}' (expected MAJOR.MINOR.PATCH)",
            def.version
        )));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    for (name, step) in &def.steps {
        if step.container.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{name}' has no container image"
            )));
        }
        if step.command.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{name}' has no command"
            )));
        }
        if !is_memory_format(&step.resources.memory) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{name}' has invalid memory request '{}' (expected e.g. 512M, 4G)",
                step.resources.memory
            )));
        }
        if let Some(limit) = &step.resources.time_limit {
            parse_duration(limit)?;
        }
    }

    dag::validate_dag(def)?;

    Ok(())
}

/// `MAJOR.MINOR.PATCH` with numeric components.
fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// `<number><M|G|T>` memory request format.
fn is_memory_format(memory: &str) -> bool {
    match memory.char_indices().last() {
        Some((idx, unit)) if matches!(unit, 'M' | 'G' | 'T') => {
            let digits = &memory[..idx];
            !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Template (for `bioflow init`)
// ---------------------------------------------------------------------------

/// A starter workflow document for the `init` command.
pub fn workflow_template(name: &str) -> String {
    format!(
        r#"name: {name}
version: "0.1.0"
description: Example two-step pipeline

config:
  greeting: hello

inputs:
  samples: "data/*.txt"

steps:
  prepare:
    container: ubuntu:22.04
    command: "echo ${{config.greeting}} > ${{run_dir}}/outputs/prepare.txt"
    resources:
      cpu: 1
      memory: 1G
      time_limit: 10m
  summarize:
    container: ubuntu:22.04
    command: "wc -l ${{run_dir}}/outputs/prepare.txt > ${{run_dir}}/outputs/summary.txt"
    after: [prepare]
"#
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
name: variant-calling
version: "1.0.0"
steps:
  align:
    container: biocontainers/bwa:0.7.17
    command: "bwa mem ref.fa ${inputs.reads}"
    resources:
      memory: 4G
      time_limit: 1h30m
  call:
    container: biocontainers/bcftools:1.17
    command: "bcftools call in.bam"
    after: [align]
"#;

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_valid_workflow() {
        let def = parse_workflow_yaml(VALID_YAML).expect("should parse");
        assert_eq!(def.name, "variant-calling");
        assert_eq!(def.steps.len(), 2);
    }

    #[test]
    fn test_parse_rejects_missing_required_keys() {
        let err = parse_workflow_yaml("name: x\nversion: \"1.0.0\"\n").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[test]
    fn test_parse_rejects_malformed_yaml() {
        let err = parse_workflow_yaml("steps: [unclosed").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    // -----------------------------------------------------------------------
    // Validation: name and version
    // -----------------------------------------------------------------------

    #[test]
    fn test_validation_rejects_bad_name() {
        let yaml = VALID_YAML.replace("variant-calling", "has spaces!");
        let err = parse_workflow_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("invalid workflow name"));
    }

    #[test]
    fn test_validation_rejects_bad_version() {
        for bad in ["1.0", "v1.0.0", "1.0.x", ""] {
            let yaml = VALID_YAML.replace("\"1.0.0\"", &format!("\"{bad}\""));
            assert!(
                parse_workflow_yaml(&yaml).is_err(),
                "version '{bad}' should be rejected"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Validation: steps
    // -----------------------------------------------------------------------

    #[test]
    fn test_validation_rejects_empty_steps() {
        let err = parse_workflow_yaml("name: x\nversion: \"1.0.0\"\nsteps: {}\n").unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_validation_rejects_empty_command() {
        let yaml = r#"
name: x
version: "1.0.0"
steps:
  a:
    container: ubuntu:22.04
    command: ""
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("no command"));
    }

    #[test]
    fn test_validation_rejects_bad_memory() {
        for bad in ["4g", "G4", "4", "lots"] {
            let yaml = VALID_YAML.replace("memory: 4G", &format!("memory: {bad}"));
            assert!(
                parse_workflow_yaml(&yaml).is_err(),
                "memory '{bad}' should be rejected"
            );
        }
    }

    #[test]
    fn test_validation_rejects_bad_time_limit() {
        let yaml = VALID_YAML.replace("time_limit: 1h30m", "time_limit: soonish");
        let err = parse_workflow_yaml(&yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidDuration(_)));
    }

    // -----------------------------------------------------------------------
    // Validation: graph
    // -----------------------------------------------------------------------

    #[test]
    fn test_validation_rejects_cycle() {
        let yaml = r#"
name: cyclic
version: "1.0.0"
steps:
  a:
    container: ubuntu:22.04
    command: "echo a"
    after: [b]
  b:
    container: ubuntu:22.04
    command: "echo b"
    after: [a]
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
    }

    #[test]
    fn test_validation_rejects_unknown_after() {
        let yaml = VALID_YAML.replace("after: [align]", "after: [nonexistent]");
        let err = parse_workflow_yaml(&yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency(_)));
    }

    // -----------------------------------------------------------------------
    // Filesystem roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows/wf.yaml");

        let def = parse_workflow_yaml(VALID_YAML).unwrap();
        save_workflow_file(&path, &def).expect("should save");

        let loaded = load_workflow_file(&path).expect("should load");
        assert_eq!(loaded.name, def.name);
        let names: Vec<&String> = loaded.steps.keys().collect();
        assert_eq!(names, vec!["align", "call"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_workflow_file(Path::new("/nonexistent/wf.yaml")).unwrap_err();
        assert!(matches!(err, WorkflowError::IoError(_)));
    }

    // -----------------------------------------------------------------------
    // Template
    // -----------------------------------------------------------------------

    #[test]
    fn test_template_is_valid() {
        let def = parse_workflow_yaml(&workflow_template("demo")).expect("template should parse");
        assert_eq!(def.name, "demo");
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps["summarize"].after, vec!["prepare"]);
    }
}
