//! Verification runner: tests, builds, lint, format, and failure parsing.
//!
//! Commands run through `sh -c` with the non-interactive environment.
//! Failing-test extraction is a per-language lookup; unknown project
//! types return empty.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use walkdir::WalkDir;

use super::{Project, ProjectType};

/// Output cap for verification command output.
const MAX_VERIFY_OUTPUT: usize = 20_000;

/// Result of one verification command.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub command: String,
    pub success: bool,
    pub output: String,
    pub duration: Duration,
    pub exit_code: i32,
}

impl VerificationResult {
    fn skipped(note: &str) -> Self {
        Self {
            command: String::new(),
            success: true,
            output: note.to_string(),
            duration: Duration::ZERO,
            exit_code: 0,
        }
    }
}

/// Runs verification commands for a detected project.
#[derive(Debug, Clone)]
pub struct Verifier {
    project: Project,
}

impl Verifier {
    /// Create a verifier for the given project.
    #[must_use]
    pub fn new(project: Project) -> Self {
        Self { project }
    }

    /// The project this verifier serves.
    #[must_use]
    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Run the test suite.
    pub async fn run_tests(&self) -> VerificationResult {
        if self.project.test_command.is_empty() {
            return VerificationResult::skipped("No test command configured for this project type");
        }
        self.run_command(&self.project.test_command.clone()).await
    }

    /// Run the build.
    pub async fn run_build(&self) -> VerificationResult {
        if self.project.build_command.is_empty() {
            return VerificationResult::skipped("No build command configured for this project type");
        }
        self.run_command(&self.project.build_command.clone()).await
    }

    /// Run the linter.
    pub async fn run_lint(&self) -> VerificationResult {
        if self.project.lint_command.is_empty() {
            return VerificationResult::skipped("No lint command configured for this project type");
        }
        self.run_command(&self.project.lint_command.clone()).await
    }

    /// Run the formatter.
    pub async fn run_format(&self) -> VerificationResult {
        if self.project.format_command.is_empty() {
            return VerificationResult::skipped(
                "No format command configured for this project type",
            );
        }
        self.run_command(&self.project.format_command.clone()).await
    }

    /// Run every configured command in format, lint, build, test order.
    pub async fn run_all(&self) -> Vec<VerificationResult> {
        let mut results = Vec::new();
        if !self.project.format_command.is_empty() {
            results.push(self.run_format().await);
        }
        if !self.project.lint_command.is_empty() {
            results.push(self.run_lint().await);
        }
        if !self.project.build_command.is_empty() {
            results.push(self.run_build().await);
        }
        if !self.project.test_command.is_empty() {
            results.push(self.run_tests().await);
        }
        results
    }

    /// A fast per-iteration check for each project type.
    pub async fn quick_check(&self) -> VerificationResult {
        match self.project.project_type {
            ProjectType::Go => self.run_command("go build ./... && go test ./...").await,
            ProjectType::Node => {
                let pm = if self.project.package_manager.is_empty() {
                    "npm"
                } else {
                    &self.project.package_manager
                };
                self.run_command(&format!("{pm} run build && {pm} test")).await
            }
            ProjectType::Python => self.run_command("pytest -x --tb=short").await,
            ProjectType::Rust => self.run_command("cargo check && cargo test").await,
            ProjectType::Make if !self.project.test_command.is_empty() => {
                self.run_command(&self.project.test_command.clone()).await
            }
            _ => VerificationResult::skipped("No quick check available for this project type"),
        }
    }

    async fn run_command(&self, command: &str) -> VerificationResult {
        let start = Instant::now();

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.project.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("CI", "true")
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) => {
                let exit_code = out.status.code().unwrap_or(-1);
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&out.stderr);
                if !stderr.is_empty() {
                    if !text.is_empty() {
                        text.push_str("\n--- stderr ---\n");
                    }
                    text.push_str(&stderr);
                }
                if text.len() > MAX_VERIFY_OUTPUT {
                    let mut cut = MAX_VERIFY_OUTPUT;
                    while cut > 0 && !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                    text.push_str("\n... (output truncated)");
                }

                VerificationResult {
                    command: command.to_string(),
                    success: out.status.success(),
                    output: text,
                    duration: start.elapsed(),
                    exit_code,
                }
            }
            Err(e) => VerificationResult {
                command: command.to_string(),
                success: false,
                output: e.to_string(),
                duration: start.elapsed(),
                exit_code: -1,
            },
        }
    }
}

/// A codebase issue found by scanning.
#[derive(Debug, Clone)]
pub struct Issue {
    pub issue_type: String,
    pub file: String,
    pub message: String,
    /// 1 = critical .. 4 = low.
    pub priority: u8,
}

/// Marker patterns scanned by [`scan_for_todos`], with their priorities.
const TODO_PATTERNS: &[(&str, u8)] = &[("FIXME", 2), ("HACK", 2), ("TODO", 3), ("XXX", 3)];

/// Find TODO/FIXME/HACK/XXX comments in the codebase.
#[must_use]
pub fn scan_for_todos(root: &Path) -> Vec<Issue> {
    let mut issues = Vec::new();

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && crate::tools::SKIP_DIRS.contains(&entry.file_name().to_string_lossy().as_ref()))
    });

    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .display()
            .to_string();

        for line in content.lines() {
            for (pattern, priority) in TODO_PATTERNS {
                if line.contains(pattern) {
                    issues.push(Issue {
                        issue_type: (*pattern).to_string(),
                        file: rel.clone(),
                        message: line.trim().to_string(),
                        priority: *priority,
                    });
                    break;
                }
            }
        }
    }

    issues
}

/// Extract failing test names from verification output.
///
/// Unknown project types return an empty list.
#[must_use]
pub fn failing_tests(output: &str, project_type: ProjectType) -> Vec<String> {
    let mut failing = Vec::new();

    match project_type {
        ProjectType::Go => {
            for line in output.lines() {
                if let Some(rest) = line.strip_prefix("--- FAIL:") {
                    if let Some(name) = rest.split_whitespace().next() {
                        failing.push(name.to_string());
                    }
                }
            }
        }
        ProjectType::Node => {
            // Jest/Vitest style
            for line in output.lines() {
                let line = line.trim();
                if let Some(rest) = line.strip_prefix("FAIL ") {
                    failing.push(rest.to_string());
                } else if line.contains('\u{2715}') || line.contains('\u{2717}') {
                    failing.push(line.to_string());
                }
            }
        }
        ProjectType::Python => {
            // pytest style
            for line in output.lines() {
                if let Some(rest) = line.strip_prefix("FAILED ") {
                    let name = rest.split(" - ").next().unwrap_or(rest);
                    failing.push(name.to_string());
                }
            }
        }
        ProjectType::Rust => {
            for line in output.lines() {
                if line.starts_with("test ") && line.contains(" FAILED") {
                    if let Some(name) = line.split_whitespace().nth(1) {
                        failing.push(name.to_string());
                    }
                }
            }
        }
        _ => {}
    }

    failing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::detect_project;
    use tempfile::TempDir;

    fn make_project(dir: &TempDir, test_command: &str) -> Project {
        let mut project = detect_project(dir.path());
        project.test_command = test_command.to_string();
        project
    }

    #[tokio::test]
    async fn test_run_tests_success() {
        let dir = TempDir::new().unwrap();
        let verifier = Verifier::new(make_project(&dir, "echo 2 passed"));

        let result = verifier.run_tests().await;
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("2 passed"));
    }

    #[tokio::test]
    async fn test_run_tests_failure_captures_stderr() {
        let dir = TempDir::new().unwrap();
        let verifier = Verifier::new(make_project(&dir, "echo boom >&2; exit 1"));

        let result = verifier.run_tests().await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("boom"));
    }

    #[tokio::test]
    async fn test_missing_command_is_skipped_success() {
        let dir = TempDir::new().unwrap();
        let verifier = Verifier::new(make_project(&dir, ""));

        let result = verifier.run_tests().await;
        assert!(result.success);
        assert!(result.command.is_empty());
        assert!(result.output.contains("No test command configured"));
    }

    #[tokio::test]
    async fn test_run_all_order() {
        let dir = TempDir::new().unwrap();
        let mut project = detect_project(dir.path());
        project.format_command = "echo fmt".to_string();
        project.build_command = "echo build".to_string();
        project.test_command = "echo test".to_string();

        let results = Verifier::new(project).run_all().await;
        let commands: Vec<&str> = results.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["echo fmt", "echo build", "echo test"]);
    }

    #[tokio::test]
    async fn test_quick_check_unknown_type() {
        let dir = TempDir::new().unwrap();
        let verifier = Verifier::new(detect_project(dir.path()));
        let result = verifier.quick_check().await;
        assert!(result.success);
        assert!(result.output.contains("No quick check available"));
    }

    #[test]
    fn test_scan_for_todos_priorities() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("code.rs"),
            "// TODO: clean this up\nfn main() {}\n// FIXME: broken on windows\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/notes.txt"), "TODO ignored").unwrap();

        let mut issues = scan_for_todos(dir.path());
        issues.sort_by_key(|i| i.priority);

        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].issue_type, "FIXME");
        assert_eq!(issues[0].priority, 2);
        assert_eq!(issues[1].issue_type, "TODO");
        assert_eq!(issues[1].priority, 3);
        assert_eq!(issues[0].file, "code.rs");
    }

    #[test]
    fn test_failing_tests_go() {
        let output = "=== RUN TestAlpha\n--- FAIL: TestAlpha (0.01s)\n--- FAIL: TestBeta (0.02s)\nFAIL\n";
        assert_eq!(
            failing_tests(output, ProjectType::Go),
            vec!["TestAlpha", "TestBeta"]
        );
    }

    #[test]
    fn test_failing_tests_node() {
        let output = "PASS src/ok.test.ts\nFAIL src/bad.test.ts\n  \u{2715} renders header (23 ms)\n";
        let failing = failing_tests(output, ProjectType::Node);
        assert_eq!(failing.len(), 2);
        assert_eq!(failing[0], "src/bad.test.ts");
        assert!(failing[1].contains("renders header"));
    }

    #[test]
    fn test_failing_tests_python() {
        let output = "FAILED tests/test_api.py::test_login - AssertionError: boom\n";
        assert_eq!(
            failing_tests(output, ProjectType::Python),
            vec!["tests/test_api.py::test_login"]
        );
    }

    #[test]
    fn test_failing_tests_rust() {
        let output = "test parser::tests::test_empty ... FAILED\ntest parser::tests::test_ok ... ok\n";
        assert_eq!(
            failing_tests(output, ProjectType::Rust),
            vec!["parser::tests::test_empty"]
        );
    }

    #[test]
    fn test_failing_tests_unknown_empty() {
        assert!(failing_tests("FAIL everything", ProjectType::Unknown).is_empty());
        assert!(failing_tests("--- FAIL: X", ProjectType::Make).is_empty());
    }
}
