//! Delivery Planner (Section 4.8): transition/rollback preview gates,
//! blockers, release comparison, and the one-line change summary.

use orch_core::{DeliveryStage, Id, OpKind, Project, ReleaseRecord, RollbackScope};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::artifact_store::ArtifactStore;
use crate::storage::Storage;

const PRODUCTION_ALIASES: &[&str] = &["prod", "production"];

/// One unmet precondition in a preview, identified by a stable gate code
/// (Section 4.8 "gates").
#[derive(Debug, Clone, Serialize)]
pub struct Blocker {
    pub code: String,
    pub message: String,
    pub why: String,
    pub next_action: String,
}

fn blocker(code: &str, why: impl Into<String>, next_action: impl Into<String>) -> Blocker {
    let why = why.into();
    Blocker {
        code: code.to_string(),
        message: gate_message(code).to_string(),
        why,
        next_action: next_action.into(),
    }
}

/// Stable, non-interpolated label per gate code; `why` carries the
/// request-specific detail.
fn gate_message(code: &str) -> &'static str {
    match code {
        "active_operation" => "another operation is already in progress for this project",
        "invalid_transition" => "the requested transition is not valid",
        "source_missing_image" => "source environment has no concrete image evidence",
        "source_not_delivered" => "source environment has no current release",
        "target_unavailable" => "target environment is not defined on the project",
        "release_unavailable" => "release does not exist for this project",
        "rollback_release_missing_image" => "selected release has no image evidence",
        "rollback_scope_invalid" => "release is missing a snapshot required by the requested scope",
        "rollback_not_safe" => "release is marked rollback_safe=false",
        _ => "blocked",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionPreview {
    pub project_id: Id,
    pub from_env: String,
    pub to_env: String,
    pub delivery_stage: DeliveryStage,
    pub ready: bool,
    pub blockers: Vec<Blocker>,
    pub change_summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseDelta {
    pub image_changed: bool,
    pub image_from: Option<String>,
    pub image_to: Option<String>,
    pub config_added: Vec<String>,
    pub config_removed: Vec<String>,
    pub config_updated: Vec<String>,
    pub rendered_added: Vec<String>,
    pub rendered_removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackPreview {
    pub project_id: Id,
    pub environment: String,
    pub target_release_id: Id,
    pub scope: RollbackScope,
    pub ready: bool,
    pub blockers: Vec<Blocker>,
    pub delta: Option<ReleaseDelta>,
    pub change_summary: String,
}

pub struct DeliveryPlanner {
    storage: Arc<Storage>,
    artifacts: Arc<ArtifactStore>,
}

impl DeliveryPlanner {
    pub fn new(storage: Arc<Storage>, artifacts: Arc<ArtifactStore>) -> Self {
        Self { storage, artifacts }
    }

    fn resolve_env_alias<'a>(&self, project: &'a Project, name: &str) -> Option<&'a str> {
        let normalized = name.trim().to_lowercase();
        if let Some((key, _)) = project
            .spec
            .environments
            .iter()
            .find(|(k, _)| k.as_str() == normalized)
        {
            return Some(key.as_str());
        }
        if PRODUCTION_ALIASES.contains(&normalized.as_str()) {
            if let Some((key, _)) = project
                .spec
                .environments
                .iter()
                .find(|(k, _)| PRODUCTION_ALIASES.contains(&k.as_str()))
            {
                return Some(key.as_str());
            }
        }
        None
    }

    async fn active_operation_blocker(&self, project: &Project) -> Option<Blocker> {
        let active_id = project.status.last_op_id.as_ref()?;
        let active_op = self.storage.get_op(active_id).await.ok()?;
        if active_op.status.is_terminal() {
            return None;
        }
        Some(blocker(
            "active_operation",
            format!(
                "operation {} ({}) is still {:?}",
                active_op.id,
                active_op.kind.as_str(),
                active_op.status
            ),
            "wait and retry preview",
        ))
    }

    /// Parse the first `image: ...` line out of a rendered/config artifact.
    fn extract_image(&self, bytes: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(bytes);
        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("image:") {
                let value = rest.trim().trim_matches('"').trim_matches('\'');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    fn source_image(&self, project_id: &Id, release: &ReleaseRecord) -> Option<String> {
        if let Some(image) = &release.image {
            if !image.is_empty() {
                return Some(image.clone());
            }
        }
        for rel_path in [&release.rendered_path, &release.config_path]
            .into_iter()
            .flatten()
        {
            if let Ok(bytes) = self.artifacts.read_file(project_id, rel_path) {
                if let Some(image) = self.extract_image(&bytes) {
                    return Some(image);
                }
            }
        }
        None
    }

    /// Transition preview for promote/release (Section 4.8).
    pub async fn preview_transition(
        &self,
        project_id: &Id,
        from_env: &str,
        to_env: &str,
        target_stage: DeliveryStage,
    ) -> crate::storage::Result<TransitionPreview> {
        let project = self.storage.get_project(project_id).await?;
        let mut blockers = Vec::new();

        if let Some(b) = self.active_operation_blocker(&project).await {
            blockers.push(b);
        }

        let resolved_from = self.resolve_env_alias(&project, from_env);
        let resolved_to = self.resolve_env_alias(&project, to_env);
        let valid = match (resolved_from, resolved_to) {
            (Some(f), Some(t)) if f != t => true,
            _ => {
                blockers.push(blocker(
                    "invalid_transition",
                    format!("from_env {from_env:?} and to_env {to_env:?} must both resolve and differ"),
                    "choose two distinct environments defined on the project",
                ));
                false
            }
        };

        let mut resolved_image = None;
        if valid {
            let from_key = resolved_from.unwrap().to_string();
            let to_key = resolved_to.unwrap().to_string();

            match self
                .storage
                .get_project_current_release(project_id, &from_key)
                .await?
            {
                Some(release) => {
                    resolved_image = self.source_image(project_id, &release);
                    if resolved_image.is_none() {
                        blockers.push(blocker(
                            "source_missing_image",
                            format!("source environment {from_key} has no concrete image evidence"),
                            "redeploy the source environment before promoting",
                        ));
                    }
                }
                None => blockers.push(blocker(
                    "source_not_delivered",
                    format!("source environment {from_key} has no current release"),
                    "deploy to the source environment first",
                )),
            }

            if to_key != "dev" && self.resolve_env_alias(&project, &to_key).is_none() {
                blockers.push(blocker(
                    "target_unavailable",
                    format!("target environment {to_key} is not defined on the project"),
                    "add the environment to the project spec",
                ));
            }

            if target_stage == DeliveryStage::Release {
                let is_production = PRODUCTION_ALIASES.contains(&to_key.as_str());
                if !is_production {
                    blockers.push(blocker(
                        "invalid_transition",
                        "release requires the target environment to be production",
                        "target the production environment for release",
                    ));
                }
            }
        }

        let ready = blockers.is_empty();
        let change_summary = if ready {
            format!(
                "promote {} from {} to {}",
                resolved_image.unwrap_or_else(|| "unknown image".to_string()),
                from_env,
                to_env
            )
        } else {
            format!("{} blocker(s) prevent this transition", blockers.len())
        };

        Ok(TransitionPreview {
            project_id: project_id.clone(),
            from_env: from_env.to_string(),
            to_env: to_env.to_string(),
            delivery_stage: target_stage,
            ready,
            blockers,
            change_summary,
        })
    }

    /// Rollback preview (Section 4.8).
    pub async fn preview_rollback(
        &self,
        project_id: &Id,
        target_release_id: &Id,
        scope: RollbackScope,
        override_unsafe: bool,
    ) -> crate::storage::Result<RollbackPreview> {
        let project = self.storage.get_project(project_id).await?;
        let mut blockers = Vec::new();

        if let Some(b) = self.active_operation_blocker(&project).await {
            blockers.push(b);
        }

        let release = match self.storage.get_release(target_release_id).await {
            Ok(release) if release.project_id == *project_id => Some(release),
            _ => {
                blockers.push(blocker(
                    "release_unavailable",
                    format!("release {target_release_id} does not exist for this project"),
                    "choose a release that belongs to this project",
                ));
                None
            }
        };

        let mut delta = None;
        let mut change_summary = String::new();

        if let Some(release) = &release {
            let image = self.source_image(project_id, release);
            if image.is_none() {
                blockers.push(blocker(
                    "rollback_release_missing_image",
                    "selected release has no image evidence",
                    "choose a release with a recorded image or rendered manifest",
                ));
            }

            let needs_config = matches!(scope, RollbackScope::CodeAndConfig | RollbackScope::FullState);
            let needs_rendered = matches!(scope, RollbackScope::FullState);
            if needs_config && release.config_path.is_none() {
                blockers.push(blocker(
                    "rollback_scope_invalid",
                    "code_and_config/full_state rollback requires a config snapshot",
                    "choose a release with a config snapshot or reduce scope to code_only",
                ));
            }
            if needs_rendered && release.rendered_path.is_none() {
                blockers.push(blocker(
                    "rollback_scope_invalid",
                    "full_state rollback requires a rendered snapshot",
                    "choose a release with a rendered snapshot or reduce scope",
                ));
            }

            if release.rollback_safe == Some(false) && !override_unsafe {
                blockers.push(blocker(
                    "rollback_not_safe",
                    "release is marked rollback_safe=false",
                    "set override=true to force this rollback",
                ));
            }

            if let Ok(Some(current)) = self
                .storage
                .get_project_current_release(project_id, &release.environment)
                .await
            {
                delta = Some(self.compare_releases(project_id, &current, release));
            }

            change_summary = if blockers.is_empty() {
                format!(
                    "roll {} back to release {} ({})",
                    release.environment,
                    release.id,
                    image.unwrap_or_else(|| "unknown image".to_string())
                )
            } else {
                format!("{} blocker(s) prevent this rollback", blockers.len())
            };
        }

        let ready = blockers.is_empty();
        Ok(RollbackPreview {
            project_id: project_id.clone(),
            environment: release.map(|r| r.environment).unwrap_or_default(),
            target_release_id: target_release_id.clone(),
            scope,
            ready,
            blockers,
            delta,
            change_summary,
        })
    }

    /// Per-dimension delta between the current and a candidate release
    /// (Section 4.8 "Release comparison").
    fn compare_releases(
        &self,
        project_id: &Id,
        current: &ReleaseRecord,
        candidate: &ReleaseRecord,
    ) -> ReleaseDelta {
        let current_image = self.source_image(project_id, current);
        let candidate_image = self.source_image(project_id, candidate);

        let current_vars = current
            .config_path
            .as_ref()
            .and_then(|p| self.artifacts.read_file(project_id, p).ok())
            .map(|b| parse_env_keys(&b))
            .unwrap_or_default();
        let candidate_vars = candidate
            .config_path
            .as_ref()
            .and_then(|p| self.artifacts.read_file(project_id, p).ok())
            .map(|b| parse_env_keys(&b))
            .unwrap_or_default();

        let added: Vec<String> = candidate_vars.difference(&current_vars).cloned().collect();
        let removed: Vec<String> = current_vars.difference(&candidate_vars).cloned().collect();
        let updated: Vec<String> = current_vars.intersection(&candidate_vars).cloned().collect();

        let current_resources = current
            .rendered_path
            .as_ref()
            .and_then(|p| self.artifacts.read_file(project_id, p).ok())
            .map(|b| parse_resource_ids(&b))
            .unwrap_or_default();
        let candidate_resources = candidate
            .rendered_path
            .as_ref()
            .and_then(|p| self.artifacts.read_file(project_id, p).ok())
            .map(|b| parse_resource_ids(&b))
            .unwrap_or_default();

        ReleaseDelta {
            image_changed: current_image != candidate_image,
            image_from: current_image,
            image_to: candidate_image,
            config_added: added,
            config_removed: removed,
            config_updated: updated,
            rendered_added: candidate_resources
                .difference(&current_resources)
                .cloned()
                .collect(),
            rendered_removed: current_resources
                .difference(&candidate_resources)
                .cloned()
                .collect(),
        }
    }
}

fn parse_env_keys(bytes: &[u8]) -> BTreeSet<String> {
    let text = String::from_utf8_lossy(bytes);
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim_start().trim_start_matches("- ");
            trimmed.split_once(':').map(|(key, _)| key.trim().to_string())
        })
        .filter(|k| !k.is_empty())
        .collect()
}

fn parse_resource_ids(bytes: &[u8]) -> BTreeSet<String> {
    let text = String::from_utf8_lossy(bytes);
    let mut kind = None;
    let mut ids = BTreeSet::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("kind:") {
            kind = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("name:") {
            if let Some(k) = &kind {
                ids.insert(format!("{k}/{}", rest.trim()));
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_core::{EnvironmentSpec, NetworkPolicies, ProjectSpec, ProjectStatus};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct TestPlanner {
        planner: DeliveryPlanner,
        storage: Arc<Storage>,
        artifacts: Arc<ArtifactStore>,
        _dir: TempDir,
    }

    async fn create_test_planner() -> TestPlanner {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let artifacts = Arc::new(ArtifactStore::new(dir.path()));
        let planner = DeliveryPlanner::new(storage.clone(), artifacts.clone());
        TestPlanner {
            planner,
            storage,
            artifacts,
            _dir: dir,
        }
    }

    fn test_project(envs: &[&str]) -> Project {
        let now = chrono::Utc::now();
        let mut environments = BTreeMap::new();
        for env in envs {
            environments.insert(env.to_string(), EnvironmentSpec::default());
        }
        Project {
            id: Id::new(),
            created_at: now,
            updated_at: now,
            spec: ProjectSpec {
                api_version: orch_core::API_VERSION.to_string(),
                kind: orch_core::KIND.to_string(),
                name: "svc-a".to_string(),
                runtime: "go_1.26".to_string(),
                capabilities: vec![],
                environments,
                network_policies: NetworkPolicies::default(),
            },
            status: ProjectStatus::new("ready"),
        }
    }

    fn test_release(project_id: &Id, environment: &str, image: &str) -> ReleaseRecord {
        ReleaseRecord {
            id: Id::new(),
            project_id: project_id.clone(),
            environment: environment.to_string(),
            op_id: Id::new(),
            op_kind: OpKind::Deploy,
            delivery_stage: DeliveryStage::Deploy,
            from_env: None,
            to_env: Some(environment.to_string()),
            image: Some(image.to_string()),
            rendered_path: None,
            config_path: None,
            rollback_safe: Some(true),
            rollback_source_release: None,
            rollback_scope: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn preview_transition_blocks_when_source_undelivered() {
        let t = create_test_planner().await;
        let project = test_project(&["dev", "staging"]);
        t.storage.put_project(&project).await.unwrap();

        let preview = t
            .planner
            .preview_transition(&project.id, "dev", "staging", DeliveryStage::Promote)
            .await
            .unwrap();

        assert!(!preview.ready);
        assert!(preview.blockers.iter().any(|b| b.code == "source_not_delivered"));
    }

    #[tokio::test]
    async fn preview_transition_ready_with_release_and_image() {
        let t = create_test_planner().await;
        let project = test_project(&["dev", "staging"]);
        t.storage.put_project(&project).await.unwrap();
        let release = test_release(&project.id, "dev", "local/svc-a:abc123");
        t.storage.put_release(&release).await.unwrap();

        let preview = t
            .planner
            .preview_transition(&project.id, "dev", "staging", DeliveryStage::Promote)
            .await
            .unwrap();

        assert!(preview.ready, "blockers: {:?}", preview.blockers);
        assert!(preview.change_summary.contains("local/svc-a:abc123"));
    }

    #[tokio::test]
    async fn preview_transition_rejects_same_environment() {
        let t = create_test_planner().await;
        let project = test_project(&["dev"]);
        t.storage.put_project(&project).await.unwrap();

        let preview = t
            .planner
            .preview_transition(&project.id, "dev", "dev", DeliveryStage::Promote)
            .await
            .unwrap();

        assert!(!preview.ready);
        assert!(preview.blockers.iter().any(|b| b.code == "invalid_transition"));
    }

    #[tokio::test]
    async fn preview_release_requires_production_target() {
        let t = create_test_planner().await;
        let project = test_project(&["dev", "staging"]);
        t.storage.put_project(&project).await.unwrap();
        let release = test_release(&project.id, "dev", "local/svc-a:abc123");
        t.storage.put_release(&release).await.unwrap();

        let preview = t
            .planner
            .preview_transition(&project.id, "dev", "staging", DeliveryStage::Release)
            .await
            .unwrap();

        assert!(!preview.ready);
        assert!(preview.blockers.iter().any(|b| b.code == "invalid_transition"));
    }

    #[tokio::test]
    async fn preview_rollback_blocks_on_unsafe_release() {
        let t = create_test_planner().await;
        let project = test_project(&["dev"]);
        t.storage.put_project(&project).await.unwrap();
        let mut release = test_release(&project.id, "dev", "local/svc-a:old");
        release.rollback_safe = Some(false);
        t.storage.put_release(&release).await.unwrap();

        let preview = t
            .planner
            .preview_rollback(&project.id, &release.id, RollbackScope::CodeOnly, false)
            .await
            .unwrap();

        assert!(!preview.ready);
        assert!(preview.blockers.iter().any(|b| b.code == "rollback_not_safe"));
    }

    #[tokio::test]
    async fn preview_rollback_override_bypasses_unsafe_blocker() {
        let t = create_test_planner().await;
        let project = test_project(&["dev"]);
        t.storage.put_project(&project).await.unwrap();
        let mut release = test_release(&project.id, "dev", "local/svc-a:old");
        release.rollback_safe = Some(false);
        t.storage.put_release(&release).await.unwrap();

        let preview = t
            .planner
            .preview_rollback(&project.id, &release.id, RollbackScope::CodeOnly, true)
            .await
            .unwrap();

        assert!(preview.ready, "blockers: {:?}", preview.blockers);
    }

    #[tokio::test]
    async fn preview_rollback_requires_config_snapshot_for_wider_scope() {
        let t = create_test_planner().await;
        let project = test_project(&["dev"]);
        t.storage.put_project(&project).await.unwrap();
        let release = test_release(&project.id, "dev", "local/svc-a:old");
        t.storage.put_release(&release).await.unwrap();

        let preview = t
            .planner
            .preview_rollback(&project.id, &release.id, RollbackScope::CodeAndConfig, false)
            .await
            .unwrap();

        assert!(!preview.ready);
        assert!(preview.blockers.iter().any(|b| b.code == "rollback_scope_invalid"));
    }

    #[tokio::test]
    async fn extract_image_finds_first_image_line() {
        let t = create_test_planner().await;
        let yaml = "spec:\n  template:\n    spec:\n      containers:\n      - image: local/svc-a:abc\n        name: app\n";
        assert_eq!(
            t.planner.extract_image(yaml.as_bytes()),
            Some("local/svc-a:abc".to_string())
        );
    }

    #[test]
    fn parse_resource_ids_pairs_kind_and_name() {
        let yaml = "kind: Deployment\nname: svc-a\n---\nkind: Service\nname: svc-a\n";
        let ids = parse_resource_ids(yaml.as_bytes());
        assert!(ids.contains("Deployment/svc-a"));
        assert!(ids.contains("Service/svc-a"));
    }
}
