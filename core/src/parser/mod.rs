/// Log Parser (§4.5): turns a memory-log file into a [`ParsedMemoryLog`], falling back to
/// plain-markdown recovery when frontmatter is missing or malformed.
pub mod completion;
pub mod validator;

use std::path::Path;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{ParserError, ParserResult};
use crate::model::{ParsedMemoryLog, TaskStatus};

static TASK_REF_FILENAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"Task_(\d+)_(\d+)").unwrap());
static TASK_REF_BODY: Lazy<Regex> = Lazy::new(|| Regex::new(r"Task\s+(\d+)\.(\d+)").unwrap());
static PROGRESS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:progress:\s*)?(\d{1,3})%\s*(?:complete|done)?").unwrap()
});
static ISO_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?").unwrap()
});

/// Splits `---\n...\n---\n<body>` frontmatter; returns `None` if the file has no
/// well-formed frontmatter block.
pub(crate) fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---\n")?;
    let end = rest.find("\n---\n")?;
    let frontmatter = &rest[..end];
    let body = &rest[end + 5..];
    Some((frontmatter, body))
}

fn extract_task_ref(filename: &str, frontmatter: Option<&str>, body: &str) -> Option<String> {
    if let Some(fm) = frontmatter {
        for line in fm.lines() {
            if let Some(value) = line.strip_prefix("task_ref:") {
                let value = value.trim().trim_matches('"');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    if let Some(caps) = TASK_REF_FILENAME.captures(filename) {
        return Some(format!("{}.{}", &caps[1], &caps[2]));
    }
    if let Some(caps) = TASK_REF_BODY.captures(body) {
        return Some(format!("{}.{}", &caps[1], &caps[2]));
    }
    None
}

pub(crate) fn extract_frontmatter_field<'a>(frontmatter: &'a str, key: &str) -> Option<&'a str> {
    let prefix = format!("{key}:");
    frontmatter.lines().find_map(|line| {
        line.strip_prefix(&prefix).map(|v| v.trim().trim_matches('"'))
    })
}

fn extract_progress(body: &str) -> Option<u8> {
    PROGRESS_PATTERN
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .map(|p| p.min(100) as u8)
}

fn extract_blockers(body: &str) -> Option<Vec<String>> {
    let section = extract_section(body, "Issues")?;
    let trimmed = section.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("none")
        || trimmed.eq_ignore_ascii_case("no issues")
    {
        return None;
    }
    let items: Vec<String> = trimmed
        .lines()
        .filter_map(|l| {
            let l = l.trim();
            l.strip_prefix("- ").or_else(|| l.strip_prefix("* "))
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Returns the body text of a `## <name>` section, up to the next `##` header or EOF.
pub fn extract_section<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let header = format!("## {name}");
    let start = body.find(&header)? + header.len();
    let rest = &body[start..];
    let end = rest.find("\n## ").unwrap_or(rest.len());
    Some(&rest[..end])
}

pub(crate) fn extract_completion_timestamp(body: &str, status: TaskStatus) -> Option<DateTime<Utc>> {
    if status != TaskStatus::Completed {
        return None;
    }
    ISO_TIMESTAMP
        .find(body)
        .and_then(|m| DateTime::parse_from_rfc3339(m.as_str()).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn has_flag(frontmatter: &str, key: &str) -> bool {
    extract_frontmatter_field(frontmatter, key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parses the memory log at `path`, falling back to plain-markdown recovery when the file
/// has no frontmatter block.
pub fn parse_memory_log(path: &Path) -> ParserResult<ParsedMemoryLog> {
    let content = std::fs::read_to_string(path)?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    match split_frontmatter(&content) {
        Some((frontmatter, body)) => parse_with_frontmatter(filename, frontmatter, body),
        None => parse_plain(filename, &content),
    }
}

fn parse_with_frontmatter(filename: &str, frontmatter: &str, body: &str) -> ParserResult<ParsedMemoryLog> {
    let task_id = extract_task_ref(filename, Some(frontmatter), body)
        .ok_or(ParserError::MissingTaskRef)?;
    let agent_id = extract_frontmatter_field(frontmatter, "agent").map(str::to_string);
    let raw_status = extract_frontmatter_field(frontmatter, "status").unwrap_or("");
    let (status, unknown) = TaskStatus::normalize(raw_status);
    if unknown {
        tracing::warn!(task_id, raw_status, "unknown status string, defaulting to InProgress");
    }

    Ok(ParsedMemoryLog {
        task_id,
        agent_id,
        status,
        progress_percent: extract_progress(body),
        blockers: extract_blockers(body),
        completion_timestamp: extract_completion_timestamp(body, status),
        has_important_findings: has_flag(frontmatter, "important_findings"),
        has_ad_hoc_delegation: has_flag(frontmatter, "ad_hoc_delegation"),
        has_compatibility_issues: has_flag(frontmatter, "compatibility_issues"),
        plain_mode: false,
    })
}

fn parse_plain(filename: &str, content: &str) -> ParserResult<ParsedMemoryLog> {
    let task_id =
        extract_task_ref(filename, None, content).ok_or(ParserError::MissingTaskRef)?;

    let inferred_status = if content.to_lowercase().contains("completed") {
        TaskStatus::Completed
    } else if content.to_lowercase().contains("blocked") {
        TaskStatus::Blocked
    } else if content.to_lowercase().contains("failed") {
        TaskStatus::Failed
    } else {
        TaskStatus::InProgress
    };

    Ok(ParsedMemoryLog {
        task_id,
        agent_id: None,
        status: inferred_status,
        progress_percent: extract_progress(content),
        blockers: extract_blockers(content),
        completion_timestamp: extract_completion_timestamp(content, inferred_status),
        has_important_findings: false,
        has_ad_hoc_delegation: false,
        has_compatibility_issues: false,
        plain_mode: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_log(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_well_formed_frontmatter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            &dir,
            "Task_1_1.md",
            "---\ntask_ref: \"1.1\"\nagent: agent-a\nstatus: Completed\n---\n## Summary\nProgress: 100% complete\n## Issues\nNone\n",
        );
        let parsed = parse_memory_log(&path).unwrap();
        assert_eq!(parsed.task_id, "1.1");
        assert_eq!(parsed.status, TaskStatus::Completed);
        assert_eq!(parsed.progress_percent, Some(100));
        assert!(parsed.blockers.is_none());
        assert!(!parsed.plain_mode);
    }

    #[test]
    fn falls_back_to_plain_mode_without_frontmatter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, "Task_2_3.md", "Work in progress on Task 2.3, 40% done.\n");
        let parsed = parse_memory_log(&path).unwrap();
        assert_eq!(parsed.task_id, "2.3");
        assert!(parsed.plain_mode);
        assert_eq!(parsed.progress_percent, Some(40));
    }

    #[test]
    fn missing_task_ref_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, "notes.md", "just some notes with no task reference\n");
        assert!(matches!(parse_memory_log(&path), Err(ParserError::MissingTaskRef)));
    }

    #[test]
    fn blockers_extracted_from_issues_section() {
        let body = "## Issues\n- database timeout\n- missing config\n## Next Steps\nfix it\n";
        let blockers = extract_blockers(body).unwrap();
        assert_eq!(blockers, vec!["database timeout", "missing config"]);
    }
}
