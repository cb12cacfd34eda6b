//! imageBuilder step worker (Section 4.5, Section 9 "Builder mode
//! resolution"): renders a Dockerfile, resolves artifact-vs-buildkit mode by
//! probing the external backend, and stages publish metadata. Real image
//! builds are out of scope (Section 1 Non-goals); the BuildKit backend is an
//! external collaborator reached only through a reachability probe.

use std::sync::Arc;
use std::time::Duration;

use orch_core::{Config, ImageBuilderMode, Id, OpKind, Project};
use serde::Serialize;

use crate::artifact_store::ArtifactStore;
use crate::storage::Storage;
use crate::worker_runtime::{Envelope, StepOutcome};

pub struct ImageBuilderContext {
    pub storage: Arc<Storage>,
    pub artifacts: Arc<ArtifactStore>,
    pub config: Arc<Config>,
}

/// BuildKit's conventional default listen socket; used only as a reachability
/// probe, never dialed for an actual build (Section 1 Non-goals).
const BUILDKIT_SOCK: &str = "/run/buildkit/buildkitd.sock";
const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Serialize)]
struct BuilderModeResolution {
    requested: Option<ImageBuilderMode>,
    effective: ImageBuilderMode,
    fallback_reason: Option<String>,
    policy_error: Option<String>,
}

pub async fn run(ctx: Arc<ImageBuilderContext>, envelope: Envelope) -> Result<StepOutcome, String> {
    if envelope.kind == OpKind::Delete {
        return Ok(StepOutcome {
            message: "image build skipped for delete".to_string(),
            artifacts: vec![],
        });
    }

    let project = ctx
        .storage
        .get_project(&envelope.project_id)
        .await
        .map_err(|e| format!("load project: {e}"))?;

    let dockerfile = render_dockerfile(&project);
    ctx.artifacts
        .write_file(&envelope.project_id, "build/Dockerfile", dockerfile.as_bytes())
        .map_err(|e| format!("write Dockerfile: {e}"))?;
    let mut artifacts = vec!["build/Dockerfile".to_string()];

    let resolution = resolve_builder_mode(ctx.config.image_builder_mode).await;
    if let Some(policy_error) = resolution.policy_error.clone() {
        let bytes = serde_json::to_vec_pretty(&resolution).unwrap_or_default();
        ctx.artifacts
            .write_file(&envelope.project_id, "build/buildkit-failure.json", &bytes)
            .ok();
        return Err(policy_error);
    }

    let image_tag = format!("local/{}:{}", safe_image_name(&project.spec.name), short_id(&envelope.op_id));

    match resolution.effective {
        ImageBuilderMode::Artifact => {
            ctx.artifacts
                .write_file(&envelope.project_id, "build/image.txt", image_tag.as_bytes())
                .map_err(|e| format!("write image.txt: {e}"))?;
            artifacts.push("build/image.txt".to_string());
        }
        ImageBuilderMode::Buildkit => {
            let step_timeout = Duration::from_secs(ctx.config.step_timeout_sec as u64);
            match invoke_buildkit(&image_tag, step_timeout).await {
                Ok(log) => {
                    ctx.artifacts
                        .write_file(&envelope.project_id, "build/buildkit-log.txt", log.as_bytes())
                        .ok();
                    ctx.artifacts
                        .write_file(&envelope.project_id, "build/image.txt", image_tag.as_bytes())
                        .map_err(|e| format!("write image.txt: {e}"))?;
                    artifacts.push("build/buildkit-log.txt".to_string());
                    artifacts.push("build/image.txt".to_string());
                }
                Err(e) => {
                    let failure = serde_json::json!({"error": e, "image": image_tag});
                    let bytes = serde_json::to_vec_pretty(&failure).unwrap_or_default();
                    ctx.artifacts
                        .write_file(&envelope.project_id, "build/buildkit-failure.json", &bytes)
                        .ok();
                    return Err(format!("buildkit build failed: {e}"));
                }
            }
        }
    }

    let publish = serde_json::json!({
        "image": image_tag,
        "mode": resolution.effective,
        "requested_mode": resolution.requested,
        "fallback_reason": resolution.fallback_reason,
    });
    let publish_bytes =
        serde_json::to_vec_pretty(&publish).map_err(|e| format!("render publish metadata: {e}"))?;
    ctx.artifacts
        .write_file(&envelope.project_id, "build/publish-local-daemon.json", &publish_bytes)
        .map_err(|e| format!("write publish metadata: {e}"))?;
    artifacts.push("build/publish-local-daemon.json".to_string());

    Ok(StepOutcome {
        message: format!("built {image_tag}"),
        artifacts,
    })
}

async fn resolve_builder_mode(requested: Option<ImageBuilderMode>) -> BuilderModeResolution {
    let reachable = probe_buildkit_daemon().await;
    match requested {
        Some(ImageBuilderMode::Buildkit) if !reachable => BuilderModeResolution {
            requested,
            effective: ImageBuilderMode::Buildkit,
            fallback_reason: None,
            policy_error: Some("buildkit requested but the daemon is unreachable".to_string()),
        },
        Some(mode) => BuilderModeResolution {
            requested,
            effective: mode,
            fallback_reason: None,
            policy_error: None,
        },
        None if reachable => BuilderModeResolution {
            requested,
            effective: ImageBuilderMode::Buildkit,
            fallback_reason: None,
            policy_error: None,
        },
        None => BuilderModeResolution {
            requested,
            effective: ImageBuilderMode::Artifact,
            fallback_reason: Some(
                "no builder mode requested and the buildkit daemon is unreachable; falling back to artifact mode"
                    .to_string(),
            ),
            policy_error: None,
        },
    }
}

#[cfg(unix)]
async fn probe_buildkit_daemon() -> bool {
    tokio::time::timeout(PROBE_TIMEOUT, tokio::net::UnixStream::connect(BUILDKIT_SOCK))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn probe_buildkit_daemon() -> bool {
    false
}

async fn invoke_buildkit(image_tag: &str, timeout: Duration) -> Result<String, String> {
    let reachable = tokio::time::timeout(timeout, probe_buildkit_daemon())
        .await
        .map_err(|_| "buildkit invocation timed out".to_string())?;
    if !reachable {
        return Err("buildkit daemon became unreachable during build".to_string());
    }
    Ok(format!(
        "buildkit: staged build for {image_tag} (external backend invocation is outside this daemon's scope)"
    ))
}

fn render_dockerfile(project: &Project) -> String {
    let base = base_image_for_runtime(&project.spec.runtime);
    let mut env_lines = String::new();
    for (name, value) in project.spec.environments.get("dev").map(|e| &e.vars).into_iter().flatten() {
        env_lines.push_str(&format!("ENV {name}={value}\n"));
    }
    format!(
        "FROM {base}\nWORKDIR /app\nCOPY . .\n{env_lines}EXPOSE 8080\nCMD [\"./start.sh\"]\n"
    )
}

fn base_image_for_runtime(runtime: &str) -> &'static str {
    if runtime.starts_with("go") {
        "golang:1-alpine"
    } else if runtime.starts_with("node") {
        "node:20-alpine"
    } else if runtime.starts_with("python") {
        "python:3-slim"
    } else if runtime.starts_with("rust") {
        "rust:1-slim"
    } else if runtime.starts_with("java") || runtime.starts_with("jvm") {
        "eclipse-temurin:21-jre"
    } else {
        "debian:stable-slim"
    }
}

fn safe_image_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

fn short_id(id: &Id) -> String {
    id.as_ref().chars().take(8).collect()
}
