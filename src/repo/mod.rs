//! Project detection: type, name, and verification commands.
//!
//! A passive lookup fed into the engine. Detection probes manifest files
//! in a fixed order and fills per-type test/build/lint/format commands;
//! node projects additionally resolve their package manager from the
//! lockfile.

pub mod verify;

use std::path::{Path, PathBuf};

pub use verify::{failing_tests, scan_for_todos, Issue, VerificationResult, Verifier};

/// Detected project type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Go,
    Node,
    Python,
    Rust,
    Java,
    Make,
    Unknown,
}

impl std::fmt::Display for ProjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Go => "go",
            Self::Node => "node",
            Self::Python => "python",
            Self::Rust => "rust",
            Self::Java => "java",
            Self::Make => "make",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A detected project and its verification commands.
#[derive(Debug, Clone)]
pub struct Project {
    pub project_type: ProjectType,
    pub root: PathBuf,
    pub name: String,
    pub test_command: String,
    pub build_command: String,
    pub lint_command: String,
    pub format_command: String,
    pub package_manager: String,
}

impl Project {
    fn unknown(root: &Path) -> Self {
        Self {
            project_type: ProjectType::Unknown,
            root: root.to_path_buf(),
            name: String::new(),
            test_command: String::new(),
            build_command: String::new(),
            lint_command: String::new(),
            format_command: String::new(),
            package_manager: String::new(),
        }
    }
}

/// Detect the project type and configuration for a workspace root.
#[must_use]
pub fn detect_project(root: &Path) -> Project {
    let mut project = Project::unknown(root);

    if root.join("go.mod").is_file() {
        project.project_type = ProjectType::Go;
        project.name = go_module_name(root);
        project.test_command = "go test ./...".to_string();
        project.build_command = "go build ./...".to_string();
        project.lint_command = "golangci-lint run".to_string();
        project.format_command = "gofmt -w .".to_string();
        return project;
    }

    if root.join("package.json").is_file() {
        project.project_type = ProjectType::Node;
        project.name = package_json_name(root);

        let pm = if root.join("pnpm-lock.yaml").is_file() {
            "pnpm"
        } else if root.join("yarn.lock").is_file() {
            "yarn"
        } else {
            "npm"
        };
        project.package_manager = pm.to_string();
        match pm {
            "npm" => {
                project.test_command = "npm test".to_string();
                project.build_command = "npm run build".to_string();
                project.lint_command = "npm run lint".to_string();
                project.format_command = "npm run format".to_string();
            }
            _ => {
                project.test_command = format!("{pm} test");
                project.build_command = format!("{pm} build");
                project.lint_command = format!("{pm} lint");
                project.format_command = format!("{pm} format");
            }
        }
        return project;
    }

    if root.join("pyproject.toml").is_file()
        || root.join("setup.py").is_file()
        || root.join("requirements.txt").is_file()
    {
        project.project_type = ProjectType::Python;
        project.test_command = "pytest".to_string();
        project.lint_command = "ruff check .".to_string();
        project.format_command = "ruff format .".to_string();
        if root.join("pyproject.toml").is_file() {
            project.name = toml_name(&root.join("pyproject.toml"));
        }
        return project;
    }

    if root.join("Cargo.toml").is_file() {
        project.project_type = ProjectType::Rust;
        project.name = toml_name(&root.join("Cargo.toml"));
        project.test_command = "cargo test".to_string();
        project.build_command = "cargo build".to_string();
        project.lint_command = "cargo clippy".to_string();
        project.format_command = "cargo fmt".to_string();
        return project;
    }

    if root.join("pom.xml").is_file() {
        project.project_type = ProjectType::Java;
        project.test_command = "mvn test".to_string();
        project.build_command = "mvn package".to_string();
        return project;
    }

    if root.join("build.gradle").is_file() || root.join("build.gradle.kts").is_file() {
        project.project_type = ProjectType::Java;
        project.test_command = "./gradlew test".to_string();
        project.build_command = "./gradlew build".to_string();
        return project;
    }

    if root.join("Makefile").is_file() {
        project.project_type = ProjectType::Make;
        if makefile_has_target(root, "test") {
            project.test_command = "make test".to_string();
        }
        if makefile_has_target(root, "build") {
            project.build_command = "make build".to_string();
        }
        if makefile_has_target(root, "lint") {
            project.lint_command = "make lint".to_string();
        }
        if makefile_has_target(root, "format") {
            project.format_command = "make format".to_string();
        }
        return project;
    }

    project
}

fn go_module_name(root: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(root.join("go.mod")) else {
        return String::new();
    };
    content
        .lines()
        .find_map(|line| line.strip_prefix("module "))
        .map(|name| name.trim().to_string())
        .unwrap_or_default()
}

fn package_json_name(root: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(root.join("package.json")) else {
        return String::new();
    };
    serde_json::from_str::<serde_json::Value>(&content)
        .ok()
        .and_then(|v| v.get("name")?.as_str().map(String::from))
        .unwrap_or_default()
}

/// Extract `name = "..."` from a TOML manifest without a TOML parser;
/// the first name key wins, which is the `[package]`/`[project]` one in
/// practice.
fn toml_name(path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("name"))
        .find_map(|line| {
            let (_, value) = line.split_once('=')?;
            Some(value.trim().trim_matches(['"', '\'']).to_string())
        })
        .unwrap_or_default()
}

fn makefile_has_target(root: &Path, target: &str) -> bool {
    let Ok(content) = std::fs::read_to_string(root.join("Makefile")) else {
        return false;
    };
    let prefix = format!("{target}:");
    content.lines().any(|line| line.starts_with(&prefix))
}
