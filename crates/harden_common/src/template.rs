//! Template rendering
//!
//! Templates use `${NAME}` placeholders. Rendering fails closed: every
//! declared variable and every referenced placeholder must be supplied,
//! and the check runs before any substitution so there is never partial
//! output.

use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::debug;

use crate::catalog;
use crate::error::{HardenError, Result};

/// Variable name -> value
pub type Variables = BTreeMap<String, String>;

/// Extension of override files in the template directory
pub const TEMPLATE_EXTENSION: &str = "tmpl";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Z][A-Z0-9_]*)\}").expect("placeholder pattern is valid"))
}

/// Names of every placeholder referenced by `text`, deduplicated.
pub fn referenced_variables(text: &str) -> BTreeSet<String> {
    placeholder_re()
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Substitute `vars` into `text`.
///
/// `required` is the out-of-band variable contract of the template.
pub fn render_text(
    template_id: &str,
    text: &str,
    required: &[String],
    vars: &Variables,
) -> Result<String> {
    let mut missing: Vec<String> = required
        .iter()
        .filter(|name| !vars.contains_key(name.as_str()))
        .cloned()
        .collect();

    for name in referenced_variables(text) {
        if !vars.contains_key(&name) && !missing.contains(&name) {
            missing.push(name);
        }
    }

    if !missing.is_empty() {
        return Err(HardenError::MissingVariable {
            template: template_id.to_string(),
            missing,
        });
    }

    let rendered = placeholder_re().replace_all(text, |caps: &Captures<'_>| {
        // Presence checked above
        vars.get(&caps[1]).cloned().unwrap_or_default()
    });

    Ok(rendered.into_owned())
}

/// Resolves template text by id and renders it
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    template_dir: Option<PathBuf>,
}

impl TemplateRenderer {
    pub fn new(template_dir: Option<PathBuf>) -> Self {
        Self { template_dir }
    }

    /// Override file first, built-in catalog second.
    pub fn load(&self, template_id: &str) -> Result<String> {
        if let Some(dir) = &self.template_dir {
            let path = dir.join(format!("{}.{}", template_id, TEMPLATE_EXTENSION));
            if path.is_file() {
                debug!(template = %template_id, path = %path.display(), "Using template override");
                return Ok(std::fs::read_to_string(path)?);
            }
        }

        catalog::builtin_template(template_id)
            .map(str::to_string)
            .ok_or_else(|| HardenError::TemplateNotFound {
                id: template_id.to_string(),
            })
    }

    pub fn render(&self, template_id: &str, required: &[String], vars: &Variables) -> Result<Vec<u8>> {
        let text = self.load(template_id)?;
        let rendered = render_text(template_id, &text, required, vars)?;
        Ok(rendered.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_all_placeholders() {
        let out = render_text(
            "t",
            "Port ${SSH_PORT}\nMaxAuthTries ${TRIES}\nPort2 ${SSH_PORT}\n",
            &["SSH_PORT".to_string()],
            &vars(&[("SSH_PORT", "2222"), ("TRIES", "3")]),
        )
        .unwrap();
        assert_eq!(out, "Port 2222\nMaxAuthTries 3\nPort2 2222\n");
        assert!(referenced_variables(&out).is_empty());
    }

    #[test]
    fn test_missing_required_variable_fails_closed() {
        let err = render_text(
            "sshd",
            "no placeholders here\n",
            &["SSH_PORT".to_string()],
            &Variables::new(),
        )
        .unwrap_err();
        match err {
            HardenError::MissingVariable { template, missing } => {
                assert_eq!(template, "sshd");
                assert_eq!(missing, vec!["SSH_PORT".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_undeclared_placeholder_is_also_missing() {
        let err = render_text("t", "value=${UNDECLARED}", &[], &Variables::new()).unwrap_err();
        assert!(matches!(err, HardenError::MissingVariable { .. }));
    }

    #[test]
    fn test_lowercase_and_bare_dollars_are_left_alone() {
        let text = "proxy_set_header Host $host;\nlog ${lower}\n";
        let out = render_text("nginx", text, &[], &Variables::new()).unwrap();
        assert_eq!(out, text);
    }

    #[test]
    fn test_override_directory_wins() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("login-banner.tmpl"), "Custom ${ORG}\n").unwrap();

        let renderer = TemplateRenderer::new(Some(dir.path().to_path_buf()));
        let out = renderer
            .render("login-banner", &[], &vars(&[("ORG", "ACME")]))
            .unwrap();
        assert_eq!(out, b"Custom ACME\n");
    }

    #[test]
    fn test_unknown_template() {
        let renderer = TemplateRenderer::default();
        assert!(matches!(
            renderer.load("does-not-exist"),
            Err(HardenError::TemplateNotFound { .. })
        ));
    }
}
