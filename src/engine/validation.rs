//! Standalone template validation, used by the CLI and the trigger
//! surface to vet a template before any run depends on it.

use serde::Serialize;

use crate::engine::Environment;

/// One problem found in a template.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateIssue {
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueKind {
    Syntax,
    MissingFragment,
}

/// Checks a template compiles against the full filter and function
/// library. Returns the empty list when the template is valid.
pub fn validate_template(environment: &mut Environment, source: &str) -> Vec<TemplateIssue> {
    match environment.compile("validation-probe", source) {
        Ok(()) => Vec::new(),
        Err(e) => {
            let message = e.to_string();
            let kind = if message.contains("not found") {
                IssueKind::MissingFragment
            } else {
                IssueKind::Syntax
            };
            vec![TemplateIssue { kind, message }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fetch::MemoryFetcher;
    use std::sync::Arc;

    #[test]
    fn valid_template_passes() {
        let mut env = Environment::new(Arc::new(MemoryFetcher::new()));
        let issues = validate_template(&mut env, r#"{"id": "{{ scene_info }}"}"#);
        assert!(issues.is_empty());
    }

    #[test]
    fn broken_syntax_reported() {
        let mut env = Environment::new(Arc::new(MemoryFetcher::new()));
        let issues = validate_template(&mut env, r#"{"id": "{% if %}"}"#);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::Syntax);
    }
}
