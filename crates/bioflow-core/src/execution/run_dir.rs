//! Per-run directory layout and input staging.
//!
//! Every run owns a canonical on-disk tree:
//!
//! ```text
//! <base_dir>/runs/<workflow_name>/<version>/<run_id>/
//!   workflow.yaml      copy of the validated definition
//!   inputs/            staged input files (link or copy)
//!   outputs/           step-produced artefacts
//!   logs/              <step>.log per step
//!   tmp/               scratch, cleaned at run end
//! ```
//!
//! The engine never deletes a run directory. The `outputs/` subtree is
//! written by step processes; two independent steps writing the same output
//! path overwrite each other in unspecified order -- guarding against that
//! is the workflow author's responsibility.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bioflow_types::workflow::WorkflowDefinition;
use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::workflow::definition::{WorkflowError, save_workflow_file};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while preparing a run directory or staging inputs.
#[derive(Debug, Error)]
pub enum RunDirError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid input pattern '{pattern}': {message}")]
    BadPattern { pattern: String, message: String },

    #[error("failed to stage input '{input}': {message}")]
    Staging { input: String, message: String },

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

// ---------------------------------------------------------------------------
// Run ID
// ---------------------------------------------------------------------------

/// Generate an opaque run ID of the form `YYYYMMDD_HHMMSS_<8-hex>`.
pub fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    format!("{timestamp}_{suffix}")
}

// ---------------------------------------------------------------------------
// RunDirectory
// ---------------------------------------------------------------------------

/// The created directory tree for one run.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    pub run_dir: PathBuf,
    pub inputs_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl RunDirectory {
    /// Create the run tree under `base_dir`.
    pub fn create(
        base_dir: &Path,
        workflow_name: &str,
        version: &str,
        run_id: &str,
    ) -> Result<Self, RunDirError> {
        let run_dir = base_dir
            .join("runs")
            .join(workflow_name)
            .join(version)
            .join(run_id);

        let layout = Self {
            inputs_dir: run_dir.join("inputs"),
            outputs_dir: run_dir.join("outputs"),
            logs_dir: run_dir.join("logs"),
            tmp_dir: run_dir.join("tmp"),
            run_dir,
        };

        for dir in [
            &layout.run_dir,
            &layout.inputs_dir,
            &layout.outputs_dir,
            &layout.logs_dir,
            &layout.tmp_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }

        tracing::info!(run_dir = %layout.run_dir.display(), "created run directory");
        Ok(layout)
    }

    /// Reattach to an existing run directory (resume). Missing
    /// subdirectories are recreated; existing content is left alone.
    pub fn open(run_dir: PathBuf) -> Result<Self, RunDirError> {
        let layout = Self {
            inputs_dir: run_dir.join("inputs"),
            outputs_dir: run_dir.join("outputs"),
            logs_dir: run_dir.join("logs"),
            tmp_dir: run_dir.join("tmp"),
            run_dir,
        };
        for dir in [
            &layout.run_dir,
            &layout.inputs_dir,
            &layout.outputs_dir,
            &layout.logs_dir,
            &layout.tmp_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(layout)
    }

    /// Write the validated definition into the run directory as
    /// `workflow.yaml`.
    pub fn save_workflow_copy(&self, def: &WorkflowDefinition) -> Result<(), RunDirError> {
        save_workflow_file(&self.run_dir.join("workflow.yaml"), def)?;
        Ok(())
    }

    /// Path of the definition copy inside the run directory.
    pub fn workflow_copy_path(&self) -> PathBuf {
        self.run_dir.join("workflow.yaml")
    }

    /// Log file path for a step.
    pub fn log_file(&self, step_name: &str) -> PathBuf {
        self.logs_dir.join(format!("{step_name}.log"))
    }

    /// Empty and recreate `tmp/`. Called once the run reaches a terminal
    /// state.
    pub fn cleanup_tmp(&self) -> Result<(), RunDirError> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
            std::fs::create_dir_all(&self.tmp_dir)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Input staging
    // -----------------------------------------------------------------------

    /// Stage inputs into `inputs/`.
    ///
    /// `declared` comes from the workflow document; `overrides` from the
    /// CLI/API and wins per key. Each value is a path or glob pattern;
    /// relative patterns resolve against the process working directory.
    /// Matches are symlinked into `inputs/` with a byte-copy fallback.
    /// A pattern with zero matches stages an empty list (warned, not fatal);
    /// an unreadable match is an error.
    ///
    /// Returns the binding map exposed as `${inputs.<key>}`: a single path
    /// for one match, an array for several.
    pub fn stage_inputs(
        &self,
        declared: &HashMap<String, String>,
        overrides: &HashMap<String, String>,
    ) -> Result<Value, RunDirError> {
        let mut effective: HashMap<&str, &str> = declared
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for (k, v) in overrides {
            effective.insert(k.as_str(), v.as_str());
        }

        let mut resolved = serde_json::Map::new();
        for (input_name, pattern) in effective {
            let staged = self.stage_single_input(input_name, pattern)?;
            let value = match staged.len() {
                1 => json!(staged[0]),
                _ => json!(staged),
            };
            resolved.insert(input_name.to_string(), value);
        }

        Ok(Value::Object(resolved))
    }

    fn stage_single_input(
        &self,
        input_name: &str,
        pattern: &str,
    ) -> Result<Vec<String>, RunDirError> {
        let matches = glob::glob(pattern).map_err(|e| RunDirError::BadPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        let mut staged = Vec::new();
        for entry in matches {
            let source = entry.map_err(|e| RunDirError::Staging {
                input: input_name.to_string(),
                message: e.to_string(),
            })?;
            let source = source.canonicalize().map_err(|e| RunDirError::Staging {
                input: input_name.to_string(),
                message: format!("{}: {e}", source.display()),
            })?;

            let file_name = source
                .file_name()
                .ok_or_else(|| RunDirError::Staging {
                    input: input_name.to_string(),
                    message: format!("{} has no file name", source.display()),
                })?;
            let target = self.inputs_dir.join(file_name);

            link_or_copy(&source, &target).map_err(|e| RunDirError::Staging {
                input: input_name.to_string(),
                message: e.to_string(),
            })?;
            staged.push(target.display().to_string());
        }

        if staged.is_empty() {
            tracing::warn!(input = input_name, pattern, "no files matched input pattern");
        }

        Ok(staged)
    }

    /// Snapshot of every file currently under `outputs/`, recursively.
    /// Used by the step runner to diff produced files.
    pub fn output_snapshot(&self) -> std::collections::HashSet<PathBuf> {
        let mut files = std::collections::HashSet::new();
        collect_files(&self.outputs_dir, &mut files);
        files
    }
}

/// Prefer a symlink; fall back to a byte copy where linking is unsupported.
fn link_or_copy(source: &Path, target: &Path) -> std::io::Result<()> {
    if target.exists() {
        std::fs::remove_file(target)?;
    }

    #[cfg(unix)]
    {
        match std::os::unix::fs::symlink(source, target) {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    source = %source.display(),
                    error = %e,
                    "symlink failed, falling back to copy"
                );
            }
        }
    }

    std::fs::copy(source, target)?;
    Ok(())
}

fn collect_files(dir: &Path, out: &mut std::collections::HashSet<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.insert(path);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_run_id_format() {
        let id = generate_run_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3, "run id '{id}' should have three parts");
        assert_eq!(parts[0].len(), 8);
        assert!(parts[0].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_run_ids_are_unique() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_create_layout() {
        let base = tempfile::tempdir().unwrap();
        let layout = RunDirectory::create(base.path(), "wf", "1.0.0", "run1").unwrap();

        assert!(layout.run_dir.ends_with("runs/wf/1.0.0/run1"));
        for dir in [
            &layout.inputs_dir,
            &layout.outputs_dir,
            &layout.logs_dir,
            &layout.tmp_dir,
        ] {
            assert!(dir.is_dir(), "{} should exist", dir.display());
        }
    }

    #[test]
    fn test_log_file_path() {
        let base = tempfile::tempdir().unwrap();
        let layout = RunDirectory::create(base.path(), "wf", "1.0.0", "run1").unwrap();
        assert!(layout.log_file("align").ends_with("logs/align.log"));
    }

    #[test]
    fn test_stage_inputs_symlinks_matches() {
        let base = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("a.fastq"), "AAAA").unwrap();
        std::fs::write(data.path().join("b.fastq"), "CCCC").unwrap();
        std::fs::write(data.path().join("notes.txt"), "skip me").unwrap();

        let layout = RunDirectory::create(base.path(), "wf", "1.0.0", "run1").unwrap();
        let pattern = format!("{}/*.fastq", data.path().display());
        let declared = HashMap::from([("reads".to_string(), pattern)]);

        let resolved = layout.stage_inputs(&declared, &HashMap::new()).unwrap();
        let reads = resolved["reads"].as_array().expect("two matches -> array");
        assert_eq!(reads.len(), 2);

        for entry in reads {
            let staged = PathBuf::from(entry.as_str().unwrap());
            assert!(staged.starts_with(&layout.inputs_dir));
            assert!(staged.exists());
        }
    }

    #[test]
    fn test_stage_single_match_is_scalar() {
        let base = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let file = data.path().join("ref.fa");
        std::fs::write(&file, ">chr1").unwrap();

        let layout = RunDirectory::create(base.path(), "wf", "1.0.0", "run1").unwrap();
        let declared = HashMap::from([("reference".to_string(), file.display().to_string())]);

        let resolved = layout.stage_inputs(&declared, &HashMap::new()).unwrap();
        assert!(resolved["reference"].is_string());
    }

    #[test]
    fn test_stage_inputs_cli_override_wins() {
        let base = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let declared_file = data.path().join("declared.txt");
        let override_file = data.path().join("override.txt");
        std::fs::write(&declared_file, "x").unwrap();
        std::fs::write(&override_file, "y").unwrap();

        let layout = RunDirectory::create(base.path(), "wf", "1.0.0", "run1").unwrap();
        let declared =
            HashMap::from([("sample".to_string(), declared_file.display().to_string())]);
        let overrides =
            HashMap::from([("sample".to_string(), override_file.display().to_string())]);

        let resolved = layout.stage_inputs(&declared, &overrides).unwrap();
        let staged = resolved["sample"].as_str().unwrap();
        assert!(staged.ends_with("override.txt"));
    }

    #[test]
    fn test_stage_inputs_no_match_is_empty_list() {
        let base = tempfile::tempdir().unwrap();
        let layout = RunDirectory::create(base.path(), "wf", "1.0.0", "run1").unwrap();
        let declared = HashMap::from([(
            "reads".to_string(),
            format!("{}/nothing/*.fastq", base.path().display()),
        )]);

        let resolved = layout.stage_inputs(&declared, &HashMap::new()).unwrap();
        assert_eq!(resolved["reads"], json!([]));
    }

    #[test]
    fn test_cleanup_tmp_preserves_rest() {
        let base = tempfile::tempdir().unwrap();
        let layout = RunDirectory::create(base.path(), "wf", "1.0.0", "run1").unwrap();
        std::fs::write(layout.tmp_dir.join("scratch.bin"), "junk").unwrap();
        std::fs::write(layout.outputs_dir.join("keep.txt"), "result").unwrap();

        layout.cleanup_tmp().unwrap();

        assert!(layout.tmp_dir.is_dir());
        assert_eq!(std::fs::read_dir(&layout.tmp_dir).unwrap().count(), 0);
        assert!(layout.outputs_dir.join("keep.txt").exists());
    }

    #[test]
    fn test_output_snapshot_diff() {
        let base = tempfile::tempdir().unwrap();
        let layout = RunDirectory::create(base.path(), "wf", "1.0.0", "run1").unwrap();
        std::fs::write(layout.outputs_dir.join("before.txt"), "a").unwrap();

        let before = layout.output_snapshot();
        std::fs::create_dir_all(layout.outputs_dir.join("nested")).unwrap();
        std::fs::write(layout.outputs_dir.join("nested/after.txt"), "b").unwrap();

        let after = layout.output_snapshot();
        let new: Vec<_> = after.difference(&before).collect();
        assert_eq!(new.len(), 1);
        assert!(new[0].ends_with("nested/after.txt"));
    }
}
