//! Final typecheck fix pass
//!
//! After the task loop exits without cancellation, the project's typecheck
//! command runs once. On failure a synthetic `fix-typecheck-errors` task is
//! built from the truncated error output and executed once - never
//! recursively.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use crate::prd::{Complexity, Task};
use crate::util::truncate_chars;

/// Error text embedded into the synthetic task is capped at this many chars
const ERROR_CAP: usize = 2000;

/// At most this many files are attached to the synthetic task
const MAX_FILES: usize = 10;

/// Task id of the synthetic fix task
pub const FIX_TASK_ID: &str = "fix-typecheck-errors";

/// Extract affected source files from typecheck output
///
/// Matches `path.ts(12,3):` and `path.tsx:12:` style locations; the first
/// ten unique paths are kept.
pub fn extract_affected_files(output: &str) -> Vec<String> {
    let re = Regex::new(r"([^\s]+\.tsx?)[(:][\d,]+[):]").expect("valid regex");

    let mut files = Vec::new();
    for capture in re.captures_iter(output) {
        let file = capture[1].to_string();
        if !files.contains(&file) {
            files.push(file);
            if files.len() >= MAX_FILES {
                break;
            }
        }
    }
    files
}

/// Run the typecheck command; Some(output) when it failed
pub async fn run_typecheck(command: &str, project_root: &Path, timeout: Duration) -> Option<String> {
    debug!(%command, "Running final typecheck");

    let outcome = tokio::time::timeout(
        timeout,
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(project_root)
            .output(),
    )
    .await;

    match outcome {
        Ok(Ok(output)) if output.status.success() => None,
        Ok(Ok(output)) => {
            let captured = if output.stdout.is_empty() {
                String::from_utf8_lossy(&output.stderr).to_string()
            } else {
                String::from_utf8_lossy(&output.stdout).to_string()
            };
            Some(captured)
        }
        Ok(Err(e)) => Some(format!("typecheck command could not run: {}", e)),
        Err(_) => Some(format!("typecheck timed out after {:?}", timeout)),
    }
}

/// Build the synthetic fix task from typecheck output
pub fn build_fix_task(output: &str) -> Task {
    let files = extract_affected_files(output);
    info!(files = files.len(), "Typecheck failed, synthesizing fix task");

    let mut task = Task::new(
        FIX_TASK_ID,
        "Fix typecheck errors",
        format!(
            "The project's typecheck failed after the task loop. Fix every reported error.\n\n\
             Typecheck output:\n{}",
            truncate_chars(output, ERROR_CAP)
        ),
    );
    task.complexity = Complexity::Moderate;
    task.files_affected = files;
    task.tags = vec!["lint".to_string()];
    task
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_paren_style_locations() {
        let output = "src/auth.ts(12,5): error TS2345\nsrc/db.tsx(3,1): error TS1005";
        assert_eq!(extract_affected_files(output), vec!["src/auth.ts", "src/db.tsx"]);
    }

    #[test]
    fn test_extracts_colon_style_locations() {
        let output = "src/auth.ts:12: error something";
        assert_eq!(extract_affected_files(output), vec!["src/auth.ts"]);
    }

    #[test]
    fn test_deduplicates_files() {
        let output = "a.ts(1,1): e1\na.ts(2,2): e2\nb.ts(3,3): e3";
        assert_eq!(extract_affected_files(output), vec!["a.ts", "b.ts"]);
    }

    #[test]
    fn test_caps_at_ten_files() {
        let output: String = (0..20).map(|i| format!("f{}.ts(1,1): error\n", i)).collect();
        assert_eq!(extract_affected_files(&output).len(), 10);
    }

    #[test]
    fn test_ignores_non_ts_files() {
        let output = "main.rs(1,1): error\nlib.py:3: error";
        assert!(extract_affected_files(output).is_empty());
    }

    #[test]
    fn test_build_fix_task() {
        let output = "src/auth.ts(12,5): error TS2345: wrong type";
        let task = build_fix_task(output);

        assert_eq!(task.id, FIX_TASK_ID);
        assert_eq!(task.complexity, Complexity::Moderate);
        assert_eq!(task.files_affected, vec!["src/auth.ts"]);
        assert!(task.description.contains("TS2345"));
    }

    #[test]
    fn test_fix_task_error_text_truncated() {
        let output = format!("a.ts(1,1): {}", "x".repeat(10_000));
        let task = build_fix_task(&output);
        assert!(task.description.len() < 3000);
    }

    #[tokio::test]
    async fn test_run_typecheck_pass() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_typecheck("true", dir.path(), Duration::from_secs(10)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_run_typecheck_failure_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_typecheck("echo 'a.ts(1,1): broken' && false", dir.path(), Duration::from_secs(10)).await;
        assert!(result.unwrap().contains("a.ts(1,1): broken"));
    }
}
