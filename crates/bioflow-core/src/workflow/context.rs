//! Run-scoped binding tree and `${...}` variable substitution.
//!
//! `RunContext` is the state that flows through a run: workflow config,
//! resolved inputs, the current step's resources, recorded step outputs,
//! and the run directory path. Command templates reference it through
//! `${...}` expressions with `.`-separated paths.
//!
//! Substitution is single-pass, left-to-right, and non-recursive.
//! Unresolved references are left byte-for-byte untouched so shell-side
//! `$var` usage can coexist with engine expansion.

use serde_json::{Value, json};

/// The binding tree for one run.
///
/// Top-level keys: `config`, `inputs`, `resources`, `steps`, `run_dir`.
#[derive(Debug, Clone)]
pub struct RunContext {
    bindings: Value,
}

impl RunContext {
    /// Create a context for a run.
    pub fn new(config: Value, inputs: Value, run_dir: &str) -> Self {
        Self {
            bindings: json!({
                "config": config,
                "inputs": inputs,
                "resources": {},
                "steps": {},
                "run_dir": run_dir,
            }),
        }
    }

    /// Replace the `resources` subtree with the current step's request.
    pub fn set_resources(&mut self, resources: Value) {
        self.bindings["resources"] = resources;
    }

    /// Record a completed step's produced files under
    /// `steps.<name>.outputs.files`.
    pub fn set_step_outputs(&mut self, step_name: &str, files: &[String]) {
        self.bindings["steps"][step_name] = json!({ "outputs": { "files": files } });
    }

    /// Look up a `.`-separated path in the binding tree.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut current = &self.bindings;
        for component in path.split('.') {
            current = current.get(component)?;
        }
        Some(current)
    }

    /// Substitute `${...}` references in a template.
    ///
    /// Single pass, left to right. A reference that does not resolve is
    /// emitted unchanged; the produced value is never re-scanned.
    pub fn resolve(&self, template: &str) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            let (before, marker) = rest.split_at(start);
            result.push_str(before);

            match marker[2..].find('}') {
                Some(end) => {
                    let path = &marker[2..2 + end];
                    match self.lookup(path) {
                        Some(value) => result.push_str(&render_value(value)),
                        None => {
                            tracing::debug!(reference = path, "unresolved variable reference");
                            result.push_str(&marker[..end + 3]);
                        }
                    }
                    rest = &marker[end + 3..];
                }
                None => {
                    // Unterminated marker: emit the remainder verbatim.
                    result.push_str(marker);
                    rest = "";
                }
            }
        }

        result.push_str(rest);
        result
    }

    /// The full binding tree (used when persisting run context snapshots).
    pub fn as_value(&self) -> &Value {
        &self.bindings
    }
}

/// Render a binding leaf for splicing into a command string.
///
/// Strings render verbatim; scalars via `to_string`; arrays and objects as
/// compact JSON.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RunContext {
        let mut ctx = RunContext::new(
            json!({ "reference": "hg38", "threads": 4 }),
            json!({ "reads": "/data/run/inputs/sample.fastq" }),
            "/data/runs/wf/1.0.0/20250311_101530_a1b2c3d4",
        );
        ctx.set_resources(json!({ "cpu": 2, "memory": "4G" }));
        ctx
    }

    #[test]
    fn test_resolve_config_reference() {
        let ctx = context();
        assert_eq!(ctx.resolve("ref=${config.reference}"), "ref=hg38");
    }

    #[test]
    fn test_resolve_integer_leaf() {
        let ctx = context();
        assert_eq!(ctx.resolve("-t ${config.threads}"), "-t 4");
        assert_eq!(ctx.resolve("--cpus ${resources.cpu}"), "--cpus 2");
    }

    #[test]
    fn test_resolve_run_dir() {
        let ctx = context();
        assert_eq!(
            ctx.resolve("${run_dir}/outputs/a.txt"),
            "/data/runs/wf/1.0.0/20250311_101530_a1b2c3d4/outputs/a.txt"
        );
    }

    #[test]
    fn test_resolve_step_outputs() {
        let mut ctx = context();
        ctx.set_step_outputs("align", &["/out/aligned.sam".to_string()]);
        assert_eq!(
            ctx.resolve("cat ${steps.align.outputs.files}"),
            r#"cat ["/out/aligned.sam"]"#
        );
    }

    #[test]
    fn test_unresolved_reference_left_untouched() {
        let ctx = context();
        assert_eq!(
            ctx.resolve("echo ${config.missing} done"),
            "echo ${config.missing} done"
        );
    }

    #[test]
    fn test_shell_dollar_vars_pass_through() {
        let ctx = context();
        assert_eq!(ctx.resolve("echo $HOME and $1"), "echo $HOME and $1");
    }

    #[test]
    fn test_substitution_is_single_pass() {
        // The produced value is not re-scanned: a config value containing a
        // reference stays literal.
        let ctx = RunContext::new(json!({ "a": "${config.b}", "b": "x" }), json!({}), "/r");
        assert_eq!(ctx.resolve("${config.a}"), "${config.b}");
    }

    #[test]
    fn test_idempotent_without_references() {
        let ctx = context();
        let plain = "samtools sort -o out.bam in.bam";
        assert_eq!(ctx.resolve(plain), plain);
        assert_eq!(ctx.resolve(&ctx.resolve(plain)), plain);
    }

    #[test]
    fn test_multiple_references_in_one_template() {
        let ctx = context();
        assert_eq!(
            ctx.resolve("bwa -t ${config.threads} ${inputs.reads}"),
            "bwa -t 4 /data/run/inputs/sample.fastq"
        );
    }

    #[test]
    fn test_unterminated_marker_left_as_is() {
        let ctx = context();
        assert_eq!(ctx.resolve("echo ${config.reference"), "echo ${config.reference");
    }

    #[test]
    fn test_empty_reference_left_as_is() {
        let ctx = context();
        assert_eq!(ctx.resolve("echo ${}"), "echo ${}");
    }

    #[test]
    fn test_lookup_walks_nested_paths() {
        let mut ctx = context();
        ctx.set_step_outputs("align", &["/a".to_string(), "/b".to_string()]);
        let files = ctx.lookup("steps.align.outputs.files").unwrap();
        assert_eq!(files.as_array().unwrap().len(), 2);
        assert!(ctx.lookup("steps.align.outputs.nope").is_none());
    }
}
