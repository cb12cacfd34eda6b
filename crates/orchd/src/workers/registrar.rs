//! registrar step worker (Section 4.5): validates and normalizes the spec on
//! create/update, writes registration artifacts. For delete, writes a
//! deregistration marker. CI never reaches this worker (Section 4.7
//! `start_subject` enters the pipeline at `bootstrap.done`).

use std::sync::Arc;

use orch_core::{OpKind, Project, ProjectSpec, ProjectStatus};

use crate::artifact_store::ArtifactStore;
use crate::storage::Storage;
use crate::worker_runtime::{Envelope, StepOutcome};

pub struct RegistrarContext {
    pub storage: Arc<Storage>,
    pub artifacts: Arc<ArtifactStore>,
}

pub async fn run(ctx: Arc<RegistrarContext>, envelope: Envelope) -> Result<StepOutcome, String> {
    match envelope.kind {
        OpKind::Delete => handle_delete(&ctx, &envelope).await,
        _ => handle_create_or_update(&ctx, &envelope).await,
    }
}

async fn handle_create_or_update(
    ctx: &RegistrarContext,
    envelope: &Envelope,
) -> Result<StepOutcome, String> {
    let spec_value = envelope
        .raw
        .get("spec")
        .cloned()
        .ok_or_else(|| "registration payload is missing \"spec\"".to_string())?;
    let mut spec: ProjectSpec =
        serde_json::from_value(spec_value).map_err(|e| format!("invalid spec: {e}"))?;
    spec.normalize();
    orch_core::validate(&spec).map_err(|e| format!("spec validation failed: {e}"))?;

    let project = match ctx.storage.get_project(&envelope.project_id).await {
        Ok(mut existing) => {
            existing.spec = spec.clone();
            existing.updated_at = chrono::Utc::now();
            existing
        }
        Err(_) => Project {
            id: envelope.project_id.clone(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            spec: spec.clone(),
            status: ProjectStatus::new("registered"),
        },
    };
    ctx.storage
        .put_project(&project)
        .await
        .map_err(|e| format!("storage error: {e}"))?;

    let yaml = serde_yaml::to_string(&spec).map_err(|e| format!("render project.yaml: {e}"))?;
    ctx.artifacts
        .write_file(&envelope.project_id, "registration/project.yaml", yaml.as_bytes())
        .map_err(|e| format!("write project.yaml: {e}"))?;

    let registration = serde_json::json!({
        "project_id": envelope.project_id,
        "op_id": envelope.op_id,
        "kind": envelope.kind,
        "registered_at": chrono::Utc::now(),
    });
    let registration_bytes = serde_json::to_vec_pretty(&registration)
        .map_err(|e| format!("render registration.json: {e}"))?;
    ctx.artifacts
        .write_file(
            &envelope.project_id,
            "registration/registration.json",
            &registration_bytes,
        )
        .map_err(|e| format!("write registration.json: {e}"))?;

    Ok(StepOutcome {
        message: format!("registered project {}", spec.name),
        artifacts: vec![
            "registration/project.yaml".to_string(),
            "registration/registration.json".to_string(),
        ],
    })
}

async fn handle_delete(ctx: &RegistrarContext, envelope: &Envelope) -> Result<StepOutcome, String> {
    let marker = format!("deregistered at {}\n", chrono::Utc::now().to_rfc3339());
    ctx.artifacts
        .write_file(
            &envelope.project_id,
            "registration/deregistered.txt",
            marker.as_bytes(),
        )
        .map_err(|e| format!("write deregistration marker: {e}"))?;
    Ok(StepOutcome {
        message: "deregistration marker written".to_string(),
        artifacts: vec!["registration/deregistered.txt".to_string()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_core::Id;
    use tempfile::TempDir;

    fn create_envelope(project_id: Id) -> Envelope {
        let raw = serde_json::json!({
            "spec": {
                "apiVersion": orch_core::API_VERSION,
                "kind": orch_core::KIND,
                "name": " Svc-A ",
                "runtime": "go_1.26",
                "capabilities": ["http"],
                "environments": {"dev": {"vars": {"LOG_LEVEL": "info"}}},
                "networkPolicies": {"ingress": "internal", "egress": "internal"},
            }
        });
        Envelope {
            op_id: Id::new(),
            project_id,
            kind: OpKind::Create,
            delivery: None,
            error: None,
            raw,
        }
    }

    #[tokio::test]
    async fn create_writes_registration_artifacts() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let artifacts = Arc::new(ArtifactStore::new(dir.path()));
        let ctx = Arc::new(RegistrarContext { storage, artifacts });

        let project_id = Id::new();
        let outcome = run(ctx.clone(), create_envelope(project_id.clone())).await.unwrap();
        assert_eq!(outcome.artifacts.len(), 2);

        let project = ctx.storage.get_project(&project_id).await.unwrap();
        assert_eq!(project.spec.name, "svc-a");

        let yaml = ctx
            .artifacts
            .read_file(&project_id, "registration/project.yaml")
            .unwrap();
        assert!(String::from_utf8(yaml).unwrap().contains("svc-a"));
    }

    #[tokio::test]
    async fn delete_writes_deregistration_marker() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let artifacts = Arc::new(ArtifactStore::new(dir.path()));
        let ctx = Arc::new(RegistrarContext { storage, artifacts });

        let mut envelope = create_envelope(Id::new());
        envelope.kind = OpKind::Delete;
        let outcome = run(ctx.clone(), envelope.clone()).await.unwrap();
        assert_eq!(outcome.artifacts, vec!["registration/deregistered.txt".to_string()]);
        assert!(ctx
            .artifacts
            .read_file(&envelope.project_id, "registration/deregistered.txt")
            .is_ok());
    }
}
