//! repoBootstrap step worker (Section 4.5): ensures local `source`/`manifests`
//! working trees exist, seeds them on first creation, and installs the
//! commit hooks that notify the local API of `main`-branch source commits.

use std::sync::Arc;

use orch_core::{Config, OpKind};

use crate::artifact_store::ArtifactStore;
use crate::git;
use crate::worker_runtime::{Envelope, StepOutcome};

pub struct RepoBootstrapContext {
    pub artifacts: Arc<ArtifactStore>,
    pub config: Arc<Config>,
}

const SEED_README: &str = "# source\n\nManaged by the platform orchestrator. Commit to `main` to trigger CI.\n";
const SEED_KUSTOMIZATION: &str = "resources: []\n";

pub async fn run(ctx: Arc<RepoBootstrapContext>, envelope: Envelope) -> Result<StepOutcome, String> {
    if envelope.kind == OpKind::Delete {
        return Ok(StepOutcome {
            message: "repo bootstrap skipped for delete".to_string(),
            artifacts: vec![],
        });
    }

    ctx.artifacts
        .ensure_project_dir(&envelope.project_id)
        .map_err(|e| format!("ensure project dir: {e}"))?;
    let project_dir = ctx.artifacts.project_dir(&envelope.project_id);
    let source_dir = project_dir.join("repos/source");
    let manifests_dir = project_dir.join("repos/manifests");

    let source_created =
        git::ensure_repo(&source_dir).map_err(|e| format!("ensure source repo: {e}"))?;
    if source_created {
        std::fs::write(source_dir.join("README.md"), SEED_README)
            .map_err(|e| format!("seed source repo: {e}"))?;
        git::commit_all_if_dirty(&source_dir, "platform-sync: seed source tree")
            .map_err(|e| format!("seed commit: {e}"))?;
    }
    // `PAAS_ENABLE_COMMIT_WATCHER` gates whether commits to `main` self-report
    // via post-commit/post-merge hooks (Section 6); disabled, the source repo
    // still exists but CI only fires through a direct webhook POST.
    if ctx.config.enable_commit_watcher {
        git::install_webhook_hooks(
            &source_dir,
            &ctx.config.local_api_base_url,
            envelope.project_id.as_ref(),
        )
        .map_err(|e| format!("install webhook hooks: {e}"))?;
    }

    let manifests_created =
        git::ensure_repo(&manifests_dir).map_err(|e| format!("ensure manifests repo: {e}"))?;
    if manifests_created {
        std::fs::create_dir_all(manifests_dir.join("base"))
            .map_err(|e| format!("seed manifests repo: {e}"))?;
        std::fs::write(manifests_dir.join("kustomization.yaml"), SEED_KUSTOMIZATION)
            .map_err(|e| format!("seed manifests repo: {e}"))?;
        git::commit_all_if_dirty(&manifests_dir, "platform-sync: seed manifests tree")
            .map_err(|e| format!("seed commit: {e}"))?;
    }

    let summary = serde_json::json!({
        "source_head": git::current_head(&source_dir),
        "manifests_head": git::current_head(&manifests_dir),
        "source_created": source_created,
        "manifests_created": manifests_created,
    });
    let bytes =
        serde_json::to_vec_pretty(&summary).map_err(|e| format!("render bootstrap summary: {e}"))?;
    ctx.artifacts
        .write_file(&envelope.project_id, "repos/bootstrap-summary.json", &bytes)
        .map_err(|e| format!("write bootstrap summary: {e}"))?;

    Ok(StepOutcome {
        message: "source and manifests repos bootstrapped".to_string(),
        artifacts: vec!["repos/bootstrap-summary.json".to_string()],
    })
}
