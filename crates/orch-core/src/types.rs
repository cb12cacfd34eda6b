//! Core domain types: project specs, projects, operations, steps, and releases.
//!
//! Mirrors the data model in Section 3: ProjectSpec, Project, Operation, Step,
//! ReleaseRecord, and the enums that drive their state machines.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque identifier, backed by a UUIDv7 so values sort close to creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Network policy value for ingress/egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicyValue {
    Internal,
    None,
}

impl NetworkPolicyValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::None => "none",
        }
    }
}

/// Per-environment variable map plus derived metadata (Section 3).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicies {
    pub ingress: NetworkPolicyValue,
    pub egress: NetworkPolicyValue,
}

impl Default for NetworkPolicies {
    fn default() -> Self {
        Self {
            ingress: NetworkPolicyValue::Internal,
            egress: NetworkPolicyValue::Internal,
        }
    }
}

/// Declarative application definition submitted by clients (Section 3).
///
/// Normalization is idempotent: `normalize(normalize(spec)) == normalize(spec)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSpec {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub runtime: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentSpec>,
    #[serde(rename = "networkPolicies", default)]
    pub network_policies: NetworkPolicies,
}

pub const API_VERSION: &str = "platform.example.com/v2";
pub const KIND: &str = "App";

impl ProjectSpec {
    /// Normalize in place: trim strings, dedupe capabilities, lowercase tokens,
    /// ensure inner maps are never implicitly absent.
    pub fn normalize(&mut self) {
        self.api_version = self.api_version.trim().to_string();
        self.kind = self.kind.trim().to_string();
        self.name = self.name.trim().to_lowercase();
        self.runtime = self.runtime.trim().to_lowercase();

        let mut seen = std::collections::BTreeSet::new();
        let mut caps = Vec::new();
        for cap in &self.capabilities {
            let cap = cap.trim().to_lowercase();
            if !cap.is_empty() && seen.insert(cap.clone()) {
                caps.push(cap);
            }
        }
        self.capabilities = caps;

        if self.environments.is_empty() {
            self.environments.insert("dev".to_string(), EnvironmentSpec::default());
        }
        for env in self.environments.values_mut() {
            env.vars = env
                .vars
                .iter()
                .map(|(k, v)| (k.trim().to_string(), v.clone()))
                .collect();
        }
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }
}

/// Project lifecycle phase (Section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ProjectPhase {
    Reconciling,
    Ready,
    Deleting,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub phase: ProjectPhase,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub last_op_id: Option<Id>,
    pub last_op_kind: Option<OpKind>,
    pub message: String,
}

impl ProjectStatus {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            phase: ProjectPhase::Reconciling,
            updated_at: chrono::Utc::now(),
            last_op_id: None,
            last_op_kind: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Id,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub spec: ProjectSpec,
    pub status: ProjectStatus,
}

/// Operation kinds (Section 3, Section 4.3 subject-chain selection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Update,
    Delete,
    Ci,
    Deploy,
    Promote,
    Release,
    Rollback,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Ci => "ci",
            Self::Deploy => "deploy",
            Self::Promote => "promote",
            Self::Release => "release",
            Self::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl OpStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// Delivery stage bucket (Section 3, glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStage {
    Deploy,
    Promote,
    Release,
}

impl DeliveryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Promote => "promote",
            Self::Release => "release",
        }
    }
}

/// Delivery lifecycle intent carried by an op and its worker messages (Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub stage: DeliveryStage,
    pub environment: String,
    pub from_env: Option<String>,
    pub to_env: Option<String>,
}

/// One worker's execution within an op (Section 3). Append-only on the op record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub worker: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub message: String,
    pub error: Option<String>,
    pub artifacts: Vec<String>,
}

impl Step {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Id,
    pub kind: OpKind,
    pub project_id: Id,
    pub delivery: Option<Delivery>,
    pub requested: chrono::DateTime<chrono::Utc>,
    pub finished: Option<chrono::DateTime<chrono::Utc>>,
    pub status: OpStatus,
    pub error: Option<String>,
    pub steps: Vec<Step>,
}

impl Operation {
    /// Most recent open step for `worker`, if any (invariant: at most one).
    pub fn open_step_mut(&mut self, worker: &str) -> Option<&mut Step> {
        self.steps
            .iter_mut()
            .rev()
            .find(|s| s.worker == worker && s.is_open())
    }

    pub fn has_ended_step(&self, worker: &str) -> Option<&Step> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.worker == worker && !s.is_open())
    }
}

/// Rollback scope (Section 4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackScope {
    CodeOnly,
    CodeAndConfig,
    FullState,
}

/// Immutable snapshot of what was delivered to an environment (Section 3, glossary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub id: Id,
    pub project_id: Id,
    pub environment: String,
    pub op_id: Id,
    pub op_kind: OpKind,
    pub delivery_stage: DeliveryStage,
    pub from_env: Option<String>,
    pub to_env: Option<String>,
    pub image: Option<String>,
    pub rendered_path: Option<String>,
    pub config_path: Option<String>,
    pub rollback_safe: Option<bool>,
    pub rollback_source_release: Option<Id>,
    pub rollback_scope: Option<RollbackScope>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let mut spec = ProjectSpec {
            api_version: " platform.example.com/v2 ".to_string(),
            kind: " App ".to_string(),
            name: " Svc-A ".to_string(),
            runtime: " Go_1.26 ".to_string(),
            capabilities: vec!["HTTP".to_string(), "http".to_string(), " http ".to_string()],
            environments: BTreeMap::new(),
            network_policies: NetworkPolicies::default(),
        };
        spec.normalize();
        let once = spec.clone();
        spec.normalize();
        assert_eq!(once, spec);
        assert_eq!(spec.capabilities, vec!["http".to_string()]);
        assert!(spec.environments.contains_key("dev"));
    }

    #[test]
    fn op_status_terminal() {
        assert!(OpStatus::Done.is_terminal());
        assert!(OpStatus::Error.is_terminal());
        assert!(!OpStatus::Queued.is_terminal());
        assert!(!OpStatus::Running.is_terminal());
    }

    #[test]
    fn open_step_lookup_finds_most_recent() {
        let mut op = Operation {
            id: Id::new(),
            kind: OpKind::Create,
            project_id: Id::new(),
            delivery: None,
            requested: chrono::Utc::now(),
            finished: None,
            status: OpStatus::Running,
            error: None,
            steps: vec![
                Step {
                    worker: "registrar".to_string(),
                    started_at: chrono::Utc::now(),
                    ended_at: Some(chrono::Utc::now()),
                    message: String::new(),
                    error: None,
                    artifacts: vec![],
                },
                Step {
                    worker: "registrar".to_string(),
                    started_at: chrono::Utc::now(),
                    ended_at: None,
                    message: String::new(),
                    error: None,
                    artifacts: vec![],
                },
            ],
        };
        assert!(op.open_step_mut("registrar").is_some());
        assert!(op.has_ended_step("registrar").is_some());
    }

    #[test]
    fn id_roundtrips_through_json() {
        let id = Id::from_string("01demo");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"01demo\"");
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
