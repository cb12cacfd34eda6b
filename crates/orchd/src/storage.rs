//! SQLite storage module for the orchestrator daemon.
//!
//! Implements persistence for projects, operations, releases, and the
//! per-project operation history index. See Section 3 and Section 4.1.

use chrono::{DateTime, Utc};
use orch_core::{
    Delivery, DeliveryStage, EnvironmentSpec, Id, NetworkPolicies, NetworkPolicyValue, OpKind,
    OpStatus, Operation, Project, ProjectPhase, ProjectSpec, ProjectStatus, ReleaseRecord,
    RollbackScope, Step,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Explicit column list for project queries (Section 4.1).
const PROJECT_COLUMNS: &str = "id, created_at, updated_at, spec_json, status_phase, \
    status_updated_at, status_last_op_id, status_last_op_kind, status_message";

const OPERATION_COLUMNS: &str =
    "id, project_id, kind, delivery_json, requested, finished, status, error, steps_json";

const RELEASE_COLUMNS: &str = "id, project_id, environment, op_id, op_kind, delivery_stage, \
    from_env, to_env, image, rendered_path, config_path, rollback_safe, \
    rollback_source_release, rollback_scope, created_at";

/// Default page size for `list_project_ops` when the caller requests 0.
const DEFAULT_LIST_LIMIT: usize = 20;
/// Hard ceiling on `list_project_ops` page size (Section 4.1 "clamped to a configured max").
const MAX_LIST_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("operation not found: {0}")]
    OperationNotFound(String),
    #[error("release not found: {0}")]
    ReleaseNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A bounded page of a project's operation history (Section 4.1 `listProjectOps`).
#[derive(Debug, Clone)]
pub struct OpPage {
    pub ops: Vec<Operation>,
    pub next_cursor: Option<String>,
}

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn migrate(&self, migrations_path: &Path) -> Result<()> {
        let migrator = sqlx::migrate::Migrator::new(migrations_path).await?;
        migrator.run(&self.pool).await?;
        Ok(())
    }

    /// Run embedded migrations, tolerating re-application (idempotent).
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Project operations (Section 4.1) ---

    pub async fn put_project(&self, project: &Project) -> Result<()> {
        let spec_json = serde_json::to_string(&project.spec)?;
        let status_last_op_kind = project.status.last_op_kind.map(|k| k.as_str().to_string());

        sqlx::query(
            r#"
            INSERT INTO projects (id, created_at, updated_at, spec_json, status_phase,
                                  status_updated_at, status_last_op_id, status_last_op_kind,
                                  status_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                updated_at = excluded.updated_at,
                spec_json = excluded.spec_json,
                status_phase = excluded.status_phase,
                status_updated_at = excluded.status_updated_at,
                status_last_op_id = excluded.status_last_op_id,
                status_last_op_kind = excluded.status_last_op_kind,
                status_message = excluded.status_message
            "#,
        )
        .bind(project.id.as_ref())
        .bind(project.created_at.timestamp_millis())
        .bind(project.updated_at.timestamp_millis())
        .bind(&spec_json)
        .bind(phase_str(project.status.phase))
        .bind(project.status.updated_at.timestamp_millis())
        .bind(project.status.last_op_id.as_ref().map(|id| id.as_ref()))
        .bind(status_last_op_kind)
        .bind(&project.status.message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_project(&self, id: &Id) -> Result<Project> {
        let query = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1");
        let row = sqlx::query_as::<_, ProjectRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::ProjectNotFound(id.to_string()))?;

        row.into_project()
    }

    pub async fn delete_project(&self, id: &Id) -> Result<()> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ProjectNotFound(id.to_string()));
        }
        Ok(())
    }

    /// List all projects, sorted by `created_at` ascending (Section 4.1).
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let query = format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at ASC");
        let rows = sqlx::query_as::<_, ProjectRow>(&query)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_project()).collect()
    }

    // --- Operation operations (Section 4.1) ---

    /// Persist an operation, maintaining the per-project history index
    /// (prepend if absent, truncate to cap, update project's `updated_at`).
    pub async fn put_op(&self, op: &Operation, history_cap: usize) -> Result<()> {
        let delivery_json = op
            .delivery
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let steps_json = serde_json::to_string(&op.steps)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO operations (id, project_id, kind, delivery_json, requested, finished,
                                    status, error, steps_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                delivery_json = excluded.delivery_json,
                finished = excluded.finished,
                status = excluded.status,
                error = excluded.error,
                steps_json = excluded.steps_json
            "#,
        )
        .bind(op.id.as_ref())
        .bind(op.project_id.as_ref())
        .bind(op.kind.as_str())
        .bind(&delivery_json)
        .bind(op.requested.timestamp_millis())
        .bind(op.finished.map(|t| t.timestamp_millis()))
        .bind(op_status_str(op.status))
        .bind(&op.error)
        .bind(&steps_json)
        .execute(&mut *tx)
        .await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT op_ids_json FROM project_op_index WHERE project_id = ?1")
                .bind(op.project_id.as_ref())
                .fetch_optional(&mut *tx)
                .await?;

        let mut ids: Vec<String> = match existing {
            Some((json,)) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        if !ids.iter().any(|id| id == op.id.as_ref()) {
            ids.insert(0, op.id.0.clone());
        }
        ids.truncate(history_cap.max(1));
        let ids_json = serde_json::to_string(&ids)?;

        sqlx::query(
            r#"
            INSERT INTO project_op_index (project_id, op_ids_json) VALUES (?1, ?2)
            ON CONFLICT(project_id) DO UPDATE SET op_ids_json = excluded.op_ids_json
            "#,
        )
        .bind(op.project_id.as_ref())
        .bind(&ids_json)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE projects SET updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now().timestamp_millis())
            .bind(op.project_id.as_ref())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_op(&self, id: &Id) -> Result<Operation> {
        let query = format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?1");
        let row = sqlx::query_as::<_, OperationRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::OperationNotFound(id.to_string()))?;

        row.into_operation()
    }

    /// Bounded page of a project's operations (Section 4.1 `listProjectOps`).
    ///
    /// `cursor` is the previous page's last op-id; `before` is either an
    /// op-id or an RFC3339 timestamp. Results are ordered newest-first.
    pub async fn list_project_ops(
        &self,
        project_id: &Id,
        limit: usize,
        cursor: Option<&str>,
        before: Option<&str>,
    ) -> Result<OpPage> {
        let limit = if limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            limit.min(MAX_LIST_LIMIT)
        };

        let boundary = if let Some(cursor) = cursor {
            Some(self.resolve_op_boundary(cursor).await?)
        } else if let Some(before) = before {
            if let Ok(ts) = DateTime::parse_from_rfc3339(before) {
                Some((ts.with_timezone(&Utc).timestamp_millis(), i64::MAX, String::new()))
            } else {
                Some(self.resolve_op_boundary(before).await?)
            }
        } else {
            None
        };

        let query = format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE project_id = ?1");
        let rows: Vec<OperationRow> = match &boundary {
            Some((ts, _, id)) if id.is_empty() => {
                let query = format!(
                    "{query} AND requested < ?2 ORDER BY requested DESC, id DESC LIMIT ?3"
                );
                sqlx::query_as(&query)
                    .bind(project_id.as_ref())
                    .bind(ts)
                    .bind((limit + 1) as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            Some((ts, _, id)) => {
                let query = format!(
                    "{query} AND (requested < ?2 OR (requested = ?2 AND id < ?3)) \
                     ORDER BY requested DESC, id DESC LIMIT ?4"
                );
                sqlx::query_as(&query)
                    .bind(project_id.as_ref())
                    .bind(ts)
                    .bind(id)
                    .bind((limit + 1) as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!("{query} ORDER BY requested DESC, id DESC LIMIT ?2");
                sqlx::query_as(&query)
                    .bind(project_id.as_ref())
                    .bind((limit + 1) as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let has_more = rows.len() > limit;
        let mut ops: Vec<Operation> = rows
            .into_iter()
            .take(limit)
            .map(|r| r.into_operation())
            .collect::<Result<Vec<_>>>()?;
        let next_cursor = if has_more {
            ops.last().map(|op| op.id.0.clone())
        } else {
            None
        };
        // ops is already built in DESC order; nothing further to sort.
        let _ = &mut ops;

        Ok(OpPage { ops, next_cursor })
    }

    async fn resolve_op_boundary(&self, op_id: &str) -> Result<(i64, i64, String)> {
        let row: (i64,) = sqlx::query_as("SELECT requested FROM operations WHERE id = ?1")
            .bind(op_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::OperationNotFound(op_id.to_string()))?;
        Ok((row.0, row.0, op_id.to_string()))
    }

    // --- Release operations (Section 4.1) ---

    pub async fn put_release(&self, release: &ReleaseRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO releases (id, project_id, environment, op_id, op_kind, delivery_stage,
                                  from_env, to_env, image, rendered_path, config_path,
                                  rollback_safe, rollback_source_release, rollback_scope,
                                  created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(release.id.as_ref())
        .bind(release.project_id.as_ref())
        .bind(&release.environment)
        .bind(release.op_id.as_ref())
        .bind(release.op_kind.as_str())
        .bind(release.delivery_stage.as_str())
        .bind(&release.from_env)
        .bind(&release.to_env)
        .bind(&release.image)
        .bind(&release.rendered_path)
        .bind(&release.config_path)
        .bind(release.rollback_safe)
        .bind(release.rollback_source_release.as_ref().map(|id| id.as_ref()))
        .bind(release.rollback_scope.map(rollback_scope_str))
        .bind(release.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_release(&self, id: &Id) -> Result<ReleaseRecord> {
        let query = format!("SELECT {RELEASE_COLUMNS} FROM releases WHERE id = ?1");
        let row = sqlx::query_as::<_, ReleaseRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::ReleaseNotFound(id.to_string()))?;
        Ok(row.into_release())
    }

    /// Most recent release for `(project, env)` by `created_at`, if any.
    pub async fn get_project_current_release(
        &self,
        project_id: &Id,
        environment: &str,
    ) -> Result<Option<ReleaseRecord>> {
        let query = format!(
            "SELECT {RELEASE_COLUMNS} FROM releases WHERE project_id = ?1 AND environment = ?2 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, ReleaseRow>(&query)
            .bind(project_id.as_ref())
            .bind(environment)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.into_release()))
    }
}

fn phase_str(phase: ProjectPhase) -> &'static str {
    match phase {
        ProjectPhase::Reconciling => "Reconciling",
        ProjectPhase::Ready => "Ready",
        ProjectPhase::Deleting => "Deleting",
        ProjectPhase::Error => "Error",
    }
}

fn parse_phase(s: &str) -> ProjectPhase {
    match s {
        "Ready" => ProjectPhase::Ready,
        "Deleting" => ProjectPhase::Deleting,
        "Error" => ProjectPhase::Error,
        _ => ProjectPhase::Reconciling,
    }
}

fn op_status_str(status: OpStatus) -> &'static str {
    match status {
        OpStatus::Queued => "queued",
        OpStatus::Running => "running",
        OpStatus::Done => "done",
        OpStatus::Error => "error",
    }
}

fn parse_op_status(s: &str) -> OpStatus {
    match s {
        "running" => OpStatus::Running,
        "done" => OpStatus::Done,
        "error" => OpStatus::Error,
        _ => OpStatus::Queued,
    }
}

fn parse_op_kind(s: &str) -> OpKind {
    match s {
        "update" => OpKind::Update,
        "delete" => OpKind::Delete,
        "ci" => OpKind::Ci,
        "deploy" => OpKind::Deploy,
        "promote" => OpKind::Promote,
        "release" => OpKind::Release,
        "rollback" => OpKind::Rollback,
        _ => OpKind::Create,
    }
}

fn parse_delivery_stage(s: &str) -> DeliveryStage {
    match s {
        "promote" => DeliveryStage::Promote,
        "release" => DeliveryStage::Release,
        _ => DeliveryStage::Deploy,
    }
}

fn rollback_scope_str(scope: RollbackScope) -> &'static str {
    match scope {
        RollbackScope::CodeOnly => "code_only",
        RollbackScope::CodeAndConfig => "code_and_config",
        RollbackScope::FullState => "full_state",
    }
}

fn parse_rollback_scope(s: &str) -> RollbackScope {
    match s {
        "code_and_config" => RollbackScope::CodeAndConfig,
        "full_state" => RollbackScope::FullState,
        _ => RollbackScope::CodeOnly,
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    created_at: i64,
    updated_at: i64,
    spec_json: String,
    status_phase: String,
    status_updated_at: i64,
    status_last_op_id: Option<String>,
    status_last_op_kind: Option<String>,
    status_message: String,
}

impl ProjectRow {
    fn into_project(self) -> Result<Project> {
        let spec: ProjectSpec = serde_json::from_str(&self.spec_json)?;
        Ok(Project {
            id: Id::from_string(self.id),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
            spec,
            status: ProjectStatus {
                phase: parse_phase(&self.status_phase),
                updated_at: DateTime::from_timestamp_millis(self.status_updated_at)
                    .unwrap_or_default(),
                last_op_id: self.status_last_op_id.map(Id::from_string),
                last_op_kind: self.status_last_op_kind.as_deref().map(parse_op_kind),
                message: self.status_message,
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    project_id: String,
    kind: String,
    delivery_json: Option<String>,
    requested: i64,
    finished: Option<i64>,
    status: String,
    error: Option<String>,
    steps_json: String,
}

impl OperationRow {
    fn into_operation(self) -> Result<Operation> {
        let delivery: Option<Delivery> = self
            .delivery_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let steps: Vec<Step> = serde_json::from_str(&self.steps_json)?;

        Ok(Operation {
            id: Id::from_string(self.id),
            kind: parse_op_kind(&self.kind),
            project_id: Id::from_string(self.project_id),
            delivery,
            requested: DateTime::from_timestamp_millis(self.requested).unwrap_or_default(),
            finished: self.finished.and_then(DateTime::from_timestamp_millis),
            status: parse_op_status(&self.status),
            error: self.error,
            steps,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReleaseRow {
    id: String,
    project_id: String,
    environment: String,
    op_id: String,
    op_kind: String,
    delivery_stage: String,
    from_env: Option<String>,
    to_env: Option<String>,
    image: Option<String>,
    rendered_path: Option<String>,
    config_path: Option<String>,
    rollback_safe: Option<bool>,
    rollback_source_release: Option<String>,
    rollback_scope: Option<String>,
    created_at: i64,
}

impl ReleaseRow {
    fn into_release(self) -> ReleaseRecord {
        ReleaseRecord {
            id: Id::from_string(self.id),
            project_id: Id::from_string(self.project_id),
            environment: self.environment,
            op_id: Id::from_string(self.op_id),
            op_kind: parse_op_kind(&self.op_kind),
            delivery_stage: parse_delivery_stage(&self.delivery_stage),
            from_env: self.from_env,
            to_env: self.to_env,
            image: self.image,
            rendered_path: self.rendered_path,
            config_path: self.config_path,
            rollback_safe: self.rollback_safe,
            rollback_source_release: self.rollback_source_release.map(Id::from_string),
            rollback_scope: self.rollback_scope.as_deref().map(parse_rollback_scope),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir,
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    fn test_spec(name: &str) -> ProjectSpec {
        let mut environments = BTreeMap::new();
        environments.insert("dev".to_string(), EnvironmentSpec::default());
        ProjectSpec {
            api_version: orch_core::API_VERSION.to_string(),
            kind: orch_core::KIND.to_string(),
            name: name.to_string(),
            runtime: "go_1.26".to_string(),
            capabilities: vec!["http".to_string()],
            environments,
            network_policies: NetworkPolicies {
                ingress: NetworkPolicyValue::Internal,
                egress: NetworkPolicyValue::Internal,
            },
        }
    }

    fn test_project(name: &str) -> Project {
        let now = Utc::now();
        Project {
            id: Id::new(),
            created_at: now,
            updated_at: now,
            spec: test_spec(name),
            status: ProjectStatus::new("created"),
        }
    }

    fn test_op(project_id: &Id, kind: OpKind) -> Operation {
        Operation {
            id: Id::new(),
            kind,
            project_id: project_id.clone(),
            delivery: None,
            requested: Utc::now(),
            finished: None,
            status: OpStatus::Queued,
            error: None,
            steps: vec![],
        }
    }

    #[tokio::test]
    async fn put_and_get_project() {
        let ts = create_test_storage().await;
        let project = test_project("svc-a");
        ts.storage.put_project(&project).await.unwrap();

        let retrieved = ts.storage.get_project(&project.id).await.unwrap();
        assert_eq!(retrieved.id, project.id);
        assert_eq!(retrieved.spec.name, "svc-a");
        assert_eq!(retrieved.status.phase, ProjectPhase::Reconciling);
    }

    #[tokio::test]
    async fn get_project_not_found() {
        let ts = create_test_storage().await;
        let result = ts.storage.get_project(&Id::new()).await;
        assert!(matches!(result, Err(StorageError::ProjectNotFound(_))));
    }

    #[tokio::test]
    async fn list_projects_sorted_ascending() {
        let ts = create_test_storage().await;
        let p1 = test_project("a");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let p2 = test_project("b");
        ts.storage.put_project(&p2).await.unwrap();
        ts.storage.put_project(&p1).await.unwrap();

        let all = ts.storage.list_projects().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].created_at <= all[1].created_at);
    }

    #[tokio::test]
    async fn delete_project_removes_it() {
        let ts = create_test_storage().await;
        let project = test_project("svc-a");
        ts.storage.put_project(&project).await.unwrap();
        ts.storage.delete_project(&project.id).await.unwrap();
        assert!(ts.storage.get_project(&project.id).await.is_err());
    }

    #[tokio::test]
    async fn put_op_maintains_history_index() {
        let ts = create_test_storage().await;
        let project = test_project("svc-a");
        ts.storage.put_project(&project).await.unwrap();

        let op1 = test_op(&project.id, OpKind::Create);
        ts.storage.put_op(&op1, 200).await.unwrap();
        let page = ts
            .storage
            .list_project_ops(&project.id, 10, None, None)
            .await
            .unwrap();
        assert_eq!(page.ops.len(), 1);
        assert_eq!(page.ops[0].id, op1.id);
    }

    #[tokio::test]
    async fn put_op_is_idempotent_in_index() {
        let ts = create_test_storage().await;
        let project = test_project("svc-a");
        ts.storage.put_project(&project).await.unwrap();

        let mut op = test_op(&project.id, OpKind::Create);
        ts.storage.put_op(&op, 200).await.unwrap();
        op.status = OpStatus::Running;
        ts.storage.put_op(&op, 200).await.unwrap();

        let page = ts
            .storage
            .list_project_ops(&project.id, 10, None, None)
            .await
            .unwrap();
        assert_eq!(page.ops.len(), 1);
        assert_eq!(page.ops[0].status, OpStatus::Running);
    }

    #[tokio::test]
    async fn history_index_cap_is_enforced() {
        let ts = create_test_storage().await;
        let project = test_project("svc-a");
        ts.storage.put_project(&project).await.unwrap();

        for _ in 0..5 {
            let op = test_op(&project.id, OpKind::Deploy);
            ts.storage.put_op(&op, 3).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let page = ts
            .storage
            .list_project_ops(&project.id, 10, None, None)
            .await
            .unwrap();
        assert_eq!(page.ops.len(), 3);
    }

    #[tokio::test]
    async fn list_project_ops_paginates_with_cursor() {
        let ts = create_test_storage().await;
        let project = test_project("svc-a");
        ts.storage.put_project(&project).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let op = test_op(&project.id, OpKind::Deploy);
            ids.push(op.id.clone());
            ts.storage.put_op(&op, 200).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let first_page = ts
            .storage
            .list_project_ops(&project.id, 2, None, None)
            .await
            .unwrap();
        assert_eq!(first_page.ops.len(), 2);
        assert!(first_page.next_cursor.is_some());

        let second_page = ts
            .storage
            .list_project_ops(&project.id, 2, first_page.next_cursor.as_deref(), None)
            .await
            .unwrap();
        assert_eq!(second_page.ops.len(), 2);
        assert_ne!(first_page.ops[0].id, second_page.ops[0].id);
    }

    #[tokio::test]
    async fn put_and_get_release() {
        let ts = create_test_storage().await;
        let project = test_project("svc-a");
        ts.storage.put_project(&project).await.unwrap();
        let op = test_op(&project.id, OpKind::Deploy);
        ts.storage.put_op(&op, 200).await.unwrap();

        let release = ReleaseRecord {
            id: Id::new(),
            project_id: project.id.clone(),
            environment: "dev".to_string(),
            op_id: op.id.clone(),
            op_kind: OpKind::Deploy,
            delivery_stage: DeliveryStage::Deploy,
            from_env: None,
            to_env: Some("dev".to_string()),
            image: Some("local/svc-a:abc123".to_string()),
            rendered_path: Some("deploy/dev/rendered.yaml".to_string()),
            config_path: Some("deploy/dev/deployment.yaml".to_string()),
            rollback_safe: Some(true),
            rollback_source_release: None,
            rollback_scope: None,
            created_at: Utc::now(),
        };
        ts.storage.put_release(&release).await.unwrap();

        let retrieved = ts.storage.get_release(&release.id).await.unwrap();
        assert_eq!(retrieved.image.as_deref(), Some("local/svc-a:abc123"));

        let current = ts
            .storage
            .get_project_current_release(&project.id, "dev")
            .await
            .unwrap();
        assert!(current.is_some());
        assert_eq!(current.unwrap().id, release.id);
    }

    #[tokio::test]
    async fn get_project_current_release_is_none_when_absent() {
        let ts = create_test_storage().await;
        let project = test_project("svc-a");
        ts.storage.put_project(&project).await.unwrap();

        let current = ts
            .storage
            .get_project_current_release(&project.id, "dev")
            .await
            .unwrap();
        assert!(current.is_none());
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();

        storage.migrate_embedded().await.unwrap();
        storage.migrate_embedded().await.unwrap();

        let project = test_project("svc-a");
        storage.put_project(&project).await.unwrap();
    }
}
