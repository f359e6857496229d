/// Log Validator (C10, §4.7): checks frontmatter and section structure under one of three
/// strictness levels. Operates on raw file content rather than a parsed record, since it
/// needs to see section header levels (`##` vs `###`) that the lighter-weight parsers discard.
use once_cell::sync::Lazy;
use regex::Regex;

use super::split_frontmatter;
use crate::errors::{ValidatorError, ValidatorResult};

/// How strictly [`validate`] treats warnings and errors (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Missing required sections and bad frontmatter fail validation.
    #[default]
    Strict,
    /// Warnings never block; errors still do.
    Lenient,
    /// Nothing blocks; errors and warnings are only recorded.
    Audit,
}

const REQUIRED_SECTIONS: &[&str] = &["Summary", "Details", "Output", "Issues", "Next Steps"];
const VALID_STATUSES: &[&str] = &["Completed", "Partial", "Blocked", "Error", "InProgress"];

static SECTION_H2: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^##\s+(.+)$").unwrap());
static SECTION_H3: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^###\s+(.+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub message: String,
}

/// Result of validating a memory log: under [`Strictness::Strict`] a non-empty `errors` means
/// the caller must reject the document; under [`Strictness::Lenient`]/[`Strictness::Audit`]
/// both lists are informational only (modulo the rule that Lenient still blocks on errors).
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(ValidationIssue { message: message.into() });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(ValidationIssue { message: message.into() });
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// Validates `content` (a full memory-log file, frontmatter + body) under `strictness`.
/// Returns `Ok(report)` when the document passes the strictness gate, or
/// `Err(ValidatorError::Failed(n))` when it does not — `report` is still attached to the
/// error-free path so callers can inspect warnings even on success.
pub fn validate(content: &str, strictness: Strictness) -> ValidatorResult<ValidationReport> {
    let mut report = ValidationReport::default();

    let Some((frontmatter, body)) = split_frontmatter(content) else {
        report.error("missing frontmatter block");
        return finish(report, strictness);
    };

    let agent = super::extract_frontmatter_field(frontmatter, "agent");
    let task_ref = super::extract_frontmatter_field(frontmatter, "task_ref");
    let status = super::extract_frontmatter_field(frontmatter, "status");

    if agent.map(str::trim).unwrap_or("").is_empty() {
        report.error("missing required frontmatter field: agent");
    }
    if task_ref.map(str::trim).unwrap_or("").is_empty() {
        report.error("missing required frontmatter field: task_ref");
    }
    let status = match status {
        Some(s) if VALID_STATUSES.iter().any(|v| v.eq_ignore_ascii_case(s.trim())) => Some(s.trim()),
        Some(s) => {
            report.error(format!("invalid status value: {s}"));
            None
        }
        None => {
            report.error("missing required frontmatter field: status");
            None
        }
    };

    for flag_key in ["ad_hoc_delegation", "compatibility_issues", "important_findings"] {
        if let Some(raw) = super::extract_frontmatter_field(frontmatter, flag_key) {
            if !matches!(raw.trim(), "true" | "false") {
                report.error(format!("frontmatter flag {flag_key} must be a boolean"));
            }
        }
    }

    let present_sections: Vec<String> = SECTION_H2
        .captures_iter(body)
        .map(|c| c[1].trim().to_string())
        .collect();

    let is_completed = status.map(|s| s.eq_ignore_ascii_case("completed")).unwrap_or(false);
    if is_completed {
        for required in REQUIRED_SECTIONS {
            if !present_sections.iter().any(|s| s.eq_ignore_ascii_case(required)) {
                report.error(format!("missing required section: {required}"));
            }
        }
    }

    for (flag_key, section_name) in [
        ("compatibility_issues", "Compatibility Concerns"),
        ("ad_hoc_delegation", "Ad-Hoc Agent Delegation"),
        ("important_findings", "Important Findings"),
    ] {
        let flag_set = super::extract_frontmatter_field(frontmatter, flag_key)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if flag_set && !present_sections.iter().any(|s| s.eq_ignore_ascii_case(section_name)) {
            report.error(format!("missing required section: {section_name}"));
        }
    }

    if SECTION_H3.is_match(body) {
        report.warn("section header uses ### where ## is expected");
    }

    if is_completed {
        let output_empty = super::extract_section(body, "Output")
            .map(|s| s.trim().is_empty())
            .unwrap_or(true);
        if output_empty {
            report.warn("status is Completed but Output section is empty");
        }
    }

    finish(report, strictness)
}

fn finish(report: ValidationReport, strictness: Strictness) -> ValidatorResult<ValidationReport> {
    match strictness {
        Strictness::Strict => {
            if !report.errors.is_empty() || !report.warnings.is_empty() {
                return Err(ValidatorError::Failed(report.errors.len() + report.warnings.len()));
            }
        }
        Strictness::Lenient => {
            if !report.errors.is_empty() {
                return Err(ValidatorError::Failed(report.errors.len()));
            }
        }
        Strictness::Audit => {}
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_COMPLETED: &str = "---\nagent: agent-a\ntask_ref: \"1.1\"\nstatus: Completed\n---\n## Summary\nx\n## Details\nx\n## Output\n- a\n## Issues\nNone\n## Next Steps\nx\n";

    #[test]
    fn strict_accepts_a_fully_formed_completed_log() {
        let report = validate(VALID_COMPLETED, Strictness::Strict).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn strict_rejects_missing_required_section() {
        let content = "---\nagent: agent-a\ntask_ref: \"1.1\"\nstatus: Completed\n---\n## Summary\nx\n";
        let result = validate(content, Strictness::Strict);
        assert!(matches!(result, Err(ValidatorError::Failed(_))));
    }

    #[test]
    fn lenient_tolerates_warnings_but_not_errors() {
        let content = "---\nagent: agent-a\ntask_ref: \"1.1\"\nstatus: Completed\n---\n### Summary\nx\n## Details\nx\n## Output\n- a\n## Issues\nNone\n## Next Steps\nx\n";
        let report = validate(content, Strictness::Lenient).unwrap();
        assert!(!report.warnings.is_empty());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn audit_never_blocks() {
        let content = "no frontmatter at all";
        let report = validate(content, Strictness::Audit).unwrap();
        assert!(!report.errors.is_empty());
    }

    #[test]
    fn conditional_section_required_when_flag_is_true() {
        let content = "---\nagent: agent-a\ntask_ref: \"1.1\"\nstatus: Partial\nimportant_findings: true\n---\n## Summary\nx\n";
        let result = validate(content, Strictness::Strict);
        assert!(matches!(result, Err(ValidatorError::Failed(_))));
    }

    #[test]
    fn invalid_boolean_flag_is_an_error() {
        let content = "---\nagent: agent-a\ntask_ref: \"1.1\"\nstatus: Partial\nimportant_findings: yes\n---\n## Summary\nx\n";
        let result = validate(content, Strictness::Strict);
        assert!(matches!(result, Err(ValidatorError::Failed(_))));
    }
}
