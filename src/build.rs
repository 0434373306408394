//! C5 — Build Orchestrator.
//!
//! Detects a project's framework by inspecting its workspace root and
//! renders a build recipe, mirroring the detection table a framework
//! scanner implements in the original source. Execution streams log
//! lines through a callback; the returned artifact identifier is opaque
//! and treated as a bound string by the pipeline.

use serde::Serialize;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProjectKind {
    Static,
    Dynamic,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildPlan {
    pub kind: ProjectKind,
    pub framework: String,
    pub build_cmd: Option<String>,
    pub start_cmd: Option<String>,
    pub output_dir: Option<String>,
}

impl BuildPlan {
    fn unknown() -> Self {
        Self {
            kind: ProjectKind::Unknown,
            framework: "unknown".into(),
            build_cmd: None,
            start_cmd: None,
            output_dir: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("unknown project type: no recognizable build signature at workspace root")]
    UnknownProjectType,
    #[error("failed to spawn build command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("build command exited with a non-zero status")]
    NonZeroExit,
}

/// Detects the framework of the project rooted at `workspace_root`.
pub fn detect(workspace_root: &Path) -> BuildPlan {
    if let Ok(raw) = std::fs::read_to_string(workspace_root.join("package.json")) {
        return detect_node(&raw);
    }
    if workspace_root.join("requirements.txt").exists()
        || workspace_root.join("pyproject.toml").exists()
    {
        return BuildPlan {
            kind: ProjectKind::Dynamic,
            framework: "python".into(),
            build_cmd: None,
            start_cmd: Some("uvicorn main:app --host 0.0.0.0 --port 8080".into()),
            output_dir: None,
        };
    }
    if workspace_root.join("index.html").exists() {
        return BuildPlan {
            kind: ProjectKind::Static,
            framework: "vanilla-html".into(),
            build_cmd: None,
            start_cmd: None,
            output_dir: Some(".".into()),
        };
    }
    BuildPlan::unknown()
}

fn detect_node(package_json_raw: &str) -> BuildPlan {
    let parsed: serde_json::Value = match serde_json::from_str(package_json_raw) {
        Ok(v) => v,
        Err(_) => return BuildPlan::unknown(),
    };
    let has_dep = |name: &str| -> bool {
        ["dependencies", "devDependencies"].iter().any(|section| {
            parsed
                .get(section)
                .and_then(|deps| deps.get(name))
                .is_some()
        })
    };

    if has_dep("next") {
        BuildPlan {
            kind: ProjectKind::Dynamic,
            framework: "nextjs".into(),
            build_cmd: Some("npm run build".into()),
            start_cmd: Some("npm run start".into()),
            output_dir: None,
        }
    } else if has_dep("vite") {
        BuildPlan {
            kind: ProjectKind::Static,
            framework: "vite".into(),
            build_cmd: Some("npm run build".into()),
            start_cmd: None,
            output_dir: Some("dist".into()),
        }
    } else if has_dep("react-scripts") {
        BuildPlan {
            kind: ProjectKind::Static,
            framework: "create-react-app".into(),
            build_cmd: Some("npm run build".into()),
            start_cmd: None,
            output_dir: Some("build".into()),
        }
    } else {
        BuildPlan {
            kind: ProjectKind::Dynamic,
            framework: "nodejs".into(),
            build_cmd: None,
            start_cmd: Some("npm start".into()),
            output_dir: None,
        }
    }
}

/// Runs the plan's build command (if any) inside `workspace_root`, streaming
/// stdout/stderr lines to `on_line`, and returns an opaque artifact tag.
pub async fn run(
    plan: &BuildPlan,
    workspace_root: &Path,
    on_line: impl Fn(&str) + Send + Sync,
) -> Result<String, BuildError> {
    if plan.kind == ProjectKind::Unknown {
        return Err(BuildError::UnknownProjectType);
    }

    if let Some(cmd) = &plan.build_cmd {
        on_line(&format!("[build] running: {cmd}"));
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(workspace_root)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(BuildError::Spawn)?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => on_line(&line),
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
                line = stderr_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => on_line(&format!("[err] {line}")),
                        Ok(None) => {},
                        Err(_) => {},
                    }
                }
            }
        }

        let status = child.wait().await.map_err(BuildError::Spawn)?;
        if !status.success() {
            return Err(BuildError::NonZeroExit);
        }
    }

    Ok(format!("{}-{}", plan.framework, uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn detects_nextjs() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"next": "14.0.0"}}"#,
        )
        .unwrap();
        let plan = detect(dir.path());
        assert_eq!(plan.framework, "nextjs");
        assert_eq!(plan.kind, ProjectKind::Dynamic);
    }

    #[test]
    fn detects_vite_as_static() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"devDependencies": {"vite": "5.0.0"}}"#,
        )
        .unwrap();
        let plan = detect(dir.path());
        assert_eq!(plan.framework, "vite");
        assert_eq!(plan.kind, ProjectKind::Static);
        assert_eq!(plan.output_dir.as_deref(), Some("dist"));
    }

    #[test]
    fn detects_create_react_app() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"react-scripts": "5.0.0"}}"#,
        )
        .unwrap();
        let plan = detect(dir.path());
        assert_eq!(plan.framework, "create-react-app");
        assert_eq!(plan.output_dir.as_deref(), Some("build"));
    }

    #[test]
    fn plain_package_json_is_generic_node() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("package.json"), r#"{"dependencies": {}}"#).unwrap();
        let plan = detect(dir.path());
        assert_eq!(plan.framework, "nodejs");
    }

    #[test]
    fn detects_python_from_requirements() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("requirements.txt"), "fastapi\n").unwrap();
        let plan = detect(dir.path());
        assert_eq!(plan.framework, "python");
    }

    #[test]
    fn detects_static_html() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        let plan = detect(dir.path());
        assert_eq!(plan.framework, "vanilla-html");
    }

    #[test]
    fn unrecognized_project_is_unknown() {
        let dir = tempdir().unwrap();
        let plan = detect(dir.path());
        assert_eq!(plan.kind, ProjectKind::Unknown);
    }

    #[tokio::test]
    async fn run_fails_fast_on_unknown_project() {
        let plan = BuildPlan::unknown();
        let dir = tempdir().unwrap();
        let err = run(&plan, dir.path(), |_| {}).await.unwrap_err();
        assert!(matches!(err, BuildError::UnknownProjectType));
    }

    #[tokio::test]
    async fn run_without_build_cmd_still_yields_artifact_tag() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        let plan = detect(dir.path());
        let tag = run(&plan, dir.path(), |_| {}).await.unwrap();
        assert!(tag.starts_with("vanilla-html-"));
    }
}
