//! Embedded Markdown prompt templates.
//!
//! Templates are compiled into the binary with `include_str!` — this
//! crate has no templating engine dependency, so this renderer does plain
//! `{{param}}` substitution rather than reaching for `handlebars`/`tera`.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{OrchestratorError, Result};

/// Workflow phase a system-prompt template is associated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplatePhase {
    Refine,
    Analyze,
    Plan,
    Execute,
}

/// Lifecycle status of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    Active,
    Reserved,
    Deprecated,
}

/// YAML front-matter header carried by every system-prompt template.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateHeader {
    pub id: String,
    pub title: String,
    pub workflow_phase: TemplatePhase,
    pub step: String,
    pub status: TemplateStatus,
    pub used_by: Vec<String>,
}

struct Template {
    header: TemplateHeader,
    body: String,
}

const RAW_TEMPLATES: &[(&str, &str)] = &[
    ("refine", include_str!("templates/refine.md")),
    ("v1_analyze", include_str!("templates/v1_analyze.md")),
    ("v2_critique", include_str!("templates/v2_critique.md")),
    ("v3_reconcile", include_str!("templates/v3_reconcile.md")),
    ("consolidate", include_str!("templates/consolidate.md")),
    ("plan", include_str!("templates/plan.md")),
    ("execute_task", include_str!("templates/execute_task.md")),
];

/// Split a template's YAML front-matter (delimited by `---` lines) from its
/// Markdown body.
fn split_front_matter(raw: &str) -> Result<(&str, &str)> {
    let rest = raw
        .strip_prefix("---\n")
        .ok_or_else(|| OrchestratorError::Validation("template missing front-matter".into()))?;
    let end = rest.find("\n---\n").ok_or_else(|| {
        OrchestratorError::Validation("template front-matter not terminated".into())
    })?;
    let header = &rest[..end];
    let body = &rest[end + "\n---\n".len()..];
    Ok((header, body.trim_start_matches('\n')))
}

fn validate_header(name: &str, header: &TemplateHeader) -> Result<()> {
    if header.id != name {
        return Err(OrchestratorError::Validation(format!(
            "template id '{}' does not match filename '{name}'",
            header.id
        )));
    }
    if header.used_by.is_empty() {
        return Err(OrchestratorError::Validation(format!(
            "template '{name}' has empty used_by"
        )));
    }
    Ok(())
}

/// Loads and renders the fixed set of embedded prompt templates.
pub struct PromptRenderer {
    templates: HashMap<String, Template>,
}

impl PromptRenderer {
    /// Parse and validate every embedded template. Panics only on a
    /// programmer error baked into the binary (malformed shipped template),
    /// following the convention of failing fast on asset bugs
    /// rather than surfacing them as a runtime `Result` the caller can't
    /// meaningfully recover from.
    pub fn new() -> Result<Self> {
        let mut templates = HashMap::new();
        for (name, raw) in RAW_TEMPLATES {
            let (header_yaml, body) = split_front_matter(raw)?;
            let header: TemplateHeader = serde_yaml::from_str(header_yaml)?;
            validate_header(name, &header)?;
            templates.insert(
                (*name).to_string(),
                Template {
                    header,
                    body: body.to_string(),
                },
            );
        }
        Ok(Self { templates })
    }

    pub fn header(&self, name: &str) -> Option<&TemplateHeader> {
        self.templates.get(name).map(|t| &t.header)
    }

    pub fn template_names(&self) -> Vec<&str> {
        self.templates.keys().map(|s| s.as_str()).collect()
    }

    /// Render template `name` with the given parameters. Each `{{key}}`
    /// occurrence is replaced by its value; unknown names are an error.
    pub fn render(&self, name: &str, params: &HashMap<String, String>) -> Result<String> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| OrchestratorError::Validation(format!("unknown template '{name}'")))?;

        let mut out = template.body.clone();
        for (key, value) in params {
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        Ok(out)
    }
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new().expect("embedded templates must be well-formed")
    }
}
