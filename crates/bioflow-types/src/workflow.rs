//! Workflow definition types for BioinfoFlow.
//!
//! Defines the canonical intermediate representation for workflow documents:
//! the YAML file on disk deserializes directly into `WorkflowDefinition`,
//! which is the single source of truth for a workflow's shape. A workflow is
//! identified by `(name, version)` and is immutable once stored; changing
//! its contents requires a new version.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical workflow definition as declared in a YAML document.
///
/// `steps` is an insertion-ordered map: when several steps become ready at
/// the same time the scheduler dispatches them in declaration order, so the
/// order of this map is observable behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name. Alphanumeric, underscores, and hyphens only.
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Global configuration scalars, exposed to commands as `${config.<key>}`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, serde_json::Value>,
    /// Declared input patterns, exposed as `${inputs.<key>}` after staging.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, String>,
    /// Ordered map of step definitions forming the workflow DAG.
    pub steps: IndexMap<String, StepDefinition>,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
///
/// The step name is the key in `WorkflowDefinition::steps`, unique within
/// the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Container image reference (e.g. "ubuntu:22.04").
    pub container: String,
    /// Command template. `${...}` references are substituted at dispatch.
    pub command: String,
    /// Resource request for the container.
    #[serde(default)]
    pub resources: Resources,
    /// Names of steps that must complete before this one starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
}

/// Resource request attached to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Number of CPU cores.
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Memory requirement string (e.g. "1G", "512M").
    #[serde(default = "default_memory")]
    pub memory: String,
    /// Wall-clock budget (e.g. "1h", "30m", "1h30m15s"). None falls back to
    /// the engine-wide default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<String>,
}

fn default_cpu() -> u32 {
    1
}

fn default_memory() -> String {
    "1G".to_string()
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory: default_memory(),
            time_limit: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_workflow() -> WorkflowDefinition {
        let yaml = r#"
name: variant-calling
version: "1.0.0"
description: Align reads and call variants
config:
  reference: hg38
  threads: 4
inputs:
  reads: "data/*.fastq"
steps:
  align:
    container: biocontainers/bwa:0.7.17
    command: "bwa mem ${config.reference} ${inputs.reads} > ${run_dir}/outputs/aligned.sam"
    resources:
      cpu: 4
      memory: 8G
      time_limit: 2h
  call:
    container: biocontainers/bcftools:1.17
    command: "bcftools call ${steps.align.outputs.files}"
    after: [align]
"#;
        serde_yaml_ng::from_str(yaml).expect("should parse")
    }

    #[test]
    fn test_yaml_parse_preserves_step_order() {
        let wf = sample_workflow();
        let names: Vec<&str> = wf.steps.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["align", "call"]);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let wf = sample_workflow();
        let yaml = serde_yaml_ng::to_string(&wf).expect("should serialize");
        let reparsed: WorkflowDefinition =
            serde_yaml_ng::from_str(&yaml).expect("should re-parse");
        assert_eq!(reparsed.name, wf.name);
        assert_eq!(reparsed.version, wf.version);
        assert_eq!(reparsed.steps.len(), wf.steps.len());
        let names: Vec<&str> = reparsed.steps.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["align", "call"]);
    }

    #[test]
    fn test_resources_defaults() {
        let wf = sample_workflow();
        let call = &wf.steps["call"];
        assert_eq!(call.resources.cpu, 1);
        assert_eq!(call.resources.memory, "1G");
        assert!(call.resources.time_limit.is_none());
    }

    #[test]
    fn test_explicit_resources() {
        let wf = sample_workflow();
        let align = &wf.steps["align"];
        assert_eq!(align.resources.cpu, 4);
        assert_eq!(align.resources.memory, "8G");
        assert_eq!(align.resources.time_limit.as_deref(), Some("2h"));
    }

    #[test]
    fn test_after_defaults_to_empty() {
        let wf = sample_workflow();
        assert!(wf.steps["align"].after.is_empty());
        assert_eq!(wf.steps["call"].after, vec!["align"]);
    }

    #[test]
    fn test_config_scalars() {
        let wf = sample_workflow();
        assert_eq!(wf.config["reference"], serde_json::json!("hg38"));
        assert_eq!(wf.config["threads"], serde_json::json!(4));
    }
}
