//! Log filename convention: `<timestamp>_<task>_<task-id>[-<suffix>].<ext>`.

use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;

use crate::format::LogFormat;
use crate::fs::basename;

const TIMESTAMP_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}T\d{2}[:-]\d{2}[:-]\d{2}.*$";

fn timestamp_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(TIMESTAMP_PATTERN).ok()).as_ref()
}

/// File name for a new log.
///
/// Colons in the timestamp and underscores in the task name are replaced by
/// `-` so the name splits cleanly on `_`.
pub fn log_file_name(task: &str, task_id: &str, created: DateTime<Utc>, format: LogFormat) -> String {
    let timestamp = created
        .to_rfc3339_opts(SecondsFormat::Secs, false)
        .replace(':', "-");
    let task = task.replace(['_', '/', '\\', ' '], "-");
    format!("{timestamp}_{task}_{task_id}{}", format.extension())
}

/// Whether `location` names a log file.
///
/// Files with the native extension always qualify; other recognized
/// extensions require the timestamp prefix.
pub fn is_log_file(location: &str, formats: &[LogFormat]) -> bool {
    let name = basename(location);
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(LogFormat::Eval.extension()) && formats.contains(&LogFormat::Eval) {
        return true;
    }
    let timestamped = timestamp_regex().is_some_and(|re| re.is_match(name));
    timestamped && formats.iter().any(|f| lower.ends_with(f.extension()))
}

/// Fields recovered from a log file name. Parsing is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFileName {
    pub task: Option<String>,
    pub task_id: Option<String>,
    pub suffix: Option<String>,
}

impl LogFileName {
    pub fn parse(location: &str) -> Self {
        let name = basename(location);
        let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
        let parts: Vec<&str> = stem.split('_').collect();

        let task = parts.get(1).map(|s| s.to_string());
        // Older names carried an extra component before the id.
        let id_idx = if parts.len() > 3 { 3 } else { 2 };
        let (task_id, suffix) = match parts.get(id_idx) {
            Some(part) => match part.split_once('-') {
                Some((id, suffix)) => (Some(id.to_string()), Some(suffix.to_string())),
                None => (Some(part.to_string()), None),
            },
            None => (None, None),
        };
        Self {
            task,
            task_id,
            suffix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-06T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn generated_name_matches_convention() {
        let name = log_file_name("my_task", "Ab12", created(), LogFormat::Eval);
        assert_eq!(name, "2024-05-06T07-08-09+00-00_my-task_Ab12.eval");
        assert!(is_log_file(&name, &LogFormat::ALL));
    }

    #[test]
    fn generated_name_parses_back() {
        let name = log_file_name("math", "xyz", created(), LogFormat::Json);
        let parsed = LogFileName::parse(&name);
        assert_eq!(parsed.task.as_deref(), Some("math"));
        assert_eq!(parsed.task_id.as_deref(), Some("xyz"));
        assert_eq!(parsed.suffix, None);
    }

    #[test]
    fn suffix_is_split_from_id() {
        let parsed = LogFileName::parse("logs/2024-01-01T00-00-00_task_id9-retry.json");
        assert_eq!(parsed.task_id.as_deref(), Some("id9"));
        assert_eq!(parsed.suffix.as_deref(), Some("retry"));
    }

    #[test]
    fn recognizes_log_files() {
        let all = LogFormat::ALL;
        assert!(is_log_file("anything.eval", &all));
        assert!(is_log_file("/x/2024-01-01T10:20:30_t_i.json", &all));
        assert!(!is_log_file("/x/notes.json", &all));
        assert!(!is_log_file("/x/2024-01-01T10-20-30_t_i.txt", &all));
        assert!(!is_log_file("anything.eval", &[LogFormat::Json]));
    }
}
