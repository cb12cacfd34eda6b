//! manifestRenderer / deployer / promoter step workers (Section 4.5): one
//! shared rendering-and-delivery body bound under three worker identities and
//! input subjects (`build.done`, `deployment.start`, `promotion.start`). Each
//! is the terminal step of its pipeline, so each finalizes the op on success
//! (Section 4.7 "`op.completed`/`op.failed` is emitted exactly once").

use std::sync::Arc;

use orch_core::{DeliveryStage, Id, OpKind, OpStatus, Project, ReleaseRecord, RollbackScope};

use crate::artifact_store::ArtifactStore;
use crate::git;
use crate::orchestrator::Orchestrator;
use crate::storage::Storage;
use crate::worker_runtime::{Envelope, StepOutcome};

pub struct DeliveryContext {
    pub storage: Arc<Storage>,
    pub artifacts: Arc<ArtifactStore>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Shared body for `manifestRenderer`/`deployer`/`promoter`.
pub async fn run(ctx: Arc<DeliveryContext>, envelope: Envelope) -> Result<StepOutcome, String> {
    if envelope.kind == OpKind::Delete {
        let outcome = handle_delete(&ctx, &envelope).await?;
        ctx.orchestrator
            .finalize_op(&envelope.op_id, OpStatus::Done)
            .await
            .ok();
        return Ok(outcome);
    }

    let project = ctx
        .storage
        .get_project(&envelope.project_id)
        .await
        .map_err(|e| format!("load project: {e}"))?;

    let resolved = resolve(&ctx, &envelope, &project).await?;

    render_manifests(
        &ctx.artifacts,
        &envelope.project_id,
        &resolved.environment,
        &project,
        &resolved.image,
    )
    .map_err(|e| format!("render manifests: {e}"))?;
    commit_manifests_repo(&ctx.artifacts, &envelope.project_id, &resolved.environment)
        .map_err(|e| format!("commit manifests repo: {e}"))?;

    let rendered_path = format!("deploy/{}/rendered.yaml", resolved.environment);
    let config_path = format!("deploy/{}/deployment.yaml", resolved.environment);

    let release = ReleaseRecord {
        id: Id::new(),
        project_id: envelope.project_id.clone(),
        environment: resolved.environment.clone(),
        op_id: envelope.op_id.clone(),
        op_kind: envelope.kind,
        delivery_stage: resolved.stage,
        from_env: resolved.from_env,
        to_env: resolved.to_env,
        image: Some(resolved.image.clone()),
        rendered_path: Some(rendered_path.clone()),
        config_path: Some(config_path.clone()),
        rollback_safe: Some(true),
        rollback_source_release: resolved.rollback_source_release,
        rollback_scope: resolved.rollback_scope,
        created_at: chrono::Utc::now(),
    };
    ctx.storage
        .put_release(&release)
        .await
        .map_err(|e| format!("store release: {e}"))?;

    ctx.orchestrator
        .finalize_op(&envelope.op_id, OpStatus::Done)
        .await
        .ok();

    Ok(StepOutcome {
        message: format!("delivered {} to {}", resolved.image, resolved.environment),
        artifacts: vec![rendered_path, config_path],
    })
}

/// What to render and record, after resolving the op's intent (Section 4.5
/// deployer/promoter) or a rollback's target release (Section 4.8).
struct ResolvedDelivery {
    stage: DeliveryStage,
    environment: String,
    from_env: Option<String>,
    to_env: Option<String>,
    image: String,
    rollback_source_release: Option<Id>,
    rollback_scope: Option<RollbackScope>,
}

async fn resolve(
    ctx: &DeliveryContext,
    envelope: &Envelope,
    project: &Project,
) -> Result<ResolvedDelivery, String> {
    if envelope.kind == OpKind::Rollback {
        return resolve_rollback(ctx, envelope).await;
    }

    let (stage, environment, from_env, to_env) = resolve_target(envelope, project)?;
    let image = resolve_image(ctx, envelope, from_env.as_deref()).await?;
    Ok(ResolvedDelivery {
        stage,
        environment,
        from_env,
        to_env,
        image,
        rollback_source_release: None,
        rollback_scope: None,
    })
}

/// Rollback re-renders and re-commits the target release's own image into its
/// own environment (Section 4.8 "rollback" scenario); it never walks the
/// `from_env`/`to_env` chain a deploy/promote does.
async fn resolve_rollback(
    ctx: &DeliveryContext,
    envelope: &Envelope,
) -> Result<ResolvedDelivery, String> {
    let target_release_id = envelope
        .raw
        .get("target_release_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "rollback payload is missing \"target_release_id\"".to_string())?;
    let target_release_id = Id::from_string(target_release_id);

    let scope: RollbackScope = match envelope.raw.get("rollback_scope") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| format!("invalid rollback_scope: {e}"))?,
        None => RollbackScope::CodeOnly,
    };

    let release = ctx
        .storage
        .get_release(&target_release_id)
        .await
        .map_err(|e| format!("load target release: {e}"))?;
    let image = release
        .image
        .clone()
        .ok_or_else(|| format!("release {target_release_id} has no image evidence"))?;

    Ok(ResolvedDelivery {
        stage: DeliveryStage::Deploy,
        environment: release.environment.clone(),
        from_env: None,
        to_env: Some(release.environment.clone()),
        image,
        rollback_source_release: Some(target_release_id),
        rollback_scope: Some(scope),
    })
}

fn resolve_target(
    envelope: &Envelope,
    project: &Project,
) -> Result<(DeliveryStage, String, Option<String>, Option<String>), String> {
    match &envelope.delivery {
        Some(delivery) => {
            let environment = delivery
                .to_env
                .clone()
                .unwrap_or_else(|| delivery.environment.clone());
            if !project.spec.environments.contains_key(&environment) {
                return Err(format!("unknown environment {environment}"));
            }
            Ok((delivery.stage, environment, delivery.from_env.clone(), delivery.to_env.clone()))
        }
        None => Ok((DeliveryStage::Deploy, "dev".to_string(), None, None)),
    }
}

async fn resolve_image(
    ctx: &DeliveryContext,
    envelope: &Envelope,
    from_env: Option<&str>,
) -> Result<String, String> {
    match from_env {
        Some(from_env) => {
            let release = ctx
                .storage
                .get_project_current_release(&envelope.project_id, from_env)
                .await
                .map_err(|e| format!("load source release: {e}"))?
                .ok_or_else(|| format!("no current release for source environment {from_env}"))?;
            release
                .image
                .ok_or_else(|| format!("source release for {from_env} has no image"))
        }
        None => {
            let bytes = ctx
                .artifacts
                .read_file(&envelope.project_id, "build/image.txt")
                .map_err(|e| format!("read built image tag: {e}"))?;
            String::from_utf8(bytes).map_err(|_| "built image tag is not valid utf-8".to_string())
        }
    }
}

fn render_manifests(
    artifacts: &ArtifactStore,
    project_id: &Id,
    environment: &str,
    project: &Project,
    image: &str,
) -> crate::artifact_store::Result<()> {
    let name = safe_resource_name(&project.spec.name);
    let deployment = format!(
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {name}\n  namespace: {environment}\nspec:\n  replicas: 1\n  template:\n    spec:\n      containers:\n        - name: {name}\n          image: {image}\n"
    );
    let service = format!(
        "apiVersion: v1\nkind: Service\nmetadata:\n  name: {name}\n  namespace: {environment}\nspec:\n  selector:\n    app: {name}\n  ports:\n    - port: 80\n"
    );
    let rendered = format!("{deployment}---\n{service}");
    let base = format!("apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {name}\n");

    artifacts.write_file(project_id, "repos/manifests/base/deployment.yaml", base.as_bytes())?;
    artifacts.write_file(
        project_id,
        &format!("repos/manifests/overlays/{environment}/deployment.yaml"),
        deployment.as_bytes(),
    )?;
    artifacts.write_file(project_id, &format!("deploy/{environment}/deployment.yaml"), deployment.as_bytes())?;
    artifacts.write_file(project_id, &format!("deploy/{environment}/service.yaml"), service.as_bytes())?;
    artifacts.write_file(project_id, &format!("deploy/{environment}/rendered.yaml"), rendered.as_bytes())?;
    Ok(())
}

fn commit_manifests_repo(artifacts: &ArtifactStore, project_id: &Id, environment: &str) -> git::Result<()> {
    let manifests_dir = artifacts.project_dir(project_id).join("repos/manifests");
    if !manifests_dir.join(".git").exists() {
        git::ensure_repo(&manifests_dir)?;
    }
    git::commit_all_if_dirty(&manifests_dir, &format!("platform-sync: render {environment}"))?;
    Ok(())
}

async fn handle_delete(ctx: &DeliveryContext, envelope: &Envelope) -> Result<StepOutcome, String> {
    let project = ctx
        .storage
        .get_project(&envelope.project_id)
        .await
        .map_err(|e| format!("load project: {e}"))?;

    let marker_path = ctx.artifacts.audit_marker_path(&project.spec.name);
    if let Some(parent) = marker_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("create audit dir: {e}"))?;
    }
    let marker = format!(
        "project {} ({}) deleted at {}\n",
        project.spec.name,
        project.id,
        chrono::Utc::now().to_rfc3339()
    );
    std::fs::write(&marker_path, marker).map_err(|e| format!("write audit marker: {e}"))?;

    ctx.artifacts
        .remove_project(&envelope.project_id)
        .map_err(|e| format!("remove project artifacts: {e}"))?;

    // The project record itself stays tombstoned (`phase=Deleting`) until
    // `finalize_op` promotes this op to `done`; the orchestrator removes the
    // row at that point (`Orchestrator::apply_terminal_project_phase`).

    Ok(StepOutcome {
        message: format!("project {} deleted", project.spec.name),
        artifacts: vec![],
    })
}

fn safe_resource_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}
