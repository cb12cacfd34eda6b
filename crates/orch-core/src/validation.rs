//! Domain validation for project specs (Section 4.10).
//!
//! All regexes are compiled once via `std::sync::LazyLock` and reused across
//! every validation call.

use crate::types::{ProjectSpec, API_VERSION, KIND};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));
static RUNTIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+([_-][a-z0-9]+)*(\.[0-9]+(\.[0-9]+)*)?$").expect("valid regex")
});
static CAPABILITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+([_-][a-z0-9]+)*$").expect("valid regex"));
static ENV_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));
static VAR_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("valid regex"));

const MAX_NAME_LEN: usize = 63;
const MAX_CAPABILITY_LEN: usize = 64;
const MAX_VALUE_BYTES: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("apiVersion must be \"{API_VERSION}\", got {0:?}")]
    ApiVersion(String),
    #[error("kind must be \"{KIND}\", got {0:?}")]
    Kind(String),
    #[error("name {0:?} must match ^[a-z0-9]([-a-z0-9]*[a-z0-9])?$ and be 1-63 chars")]
    Name(String),
    #[error("runtime {0:?} is not a valid tokenized id")]
    Runtime(String),
    #[error("capability {0:?} is invalid or exceeds {MAX_CAPABILITY_LEN} chars")]
    Capability(String),
    #[error("at least one environment is required")]
    NoEnvironments,
    #[error("environment name {0:?} is invalid")]
    EnvironmentName(String),
    #[error("environment variable name {0:?} in env {1:?} is invalid")]
    VarName(String, String),
    #[error("environment variable {0:?} in env {1:?} exceeds {MAX_VALUE_BYTES} bytes")]
    VarValueTooLarge(String, String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Validate a normalized spec. Callers should call `ProjectSpec::normalize` first.
pub fn validate(spec: &ProjectSpec) -> Result<()> {
    if spec.api_version != API_VERSION {
        return Err(ValidationError::ApiVersion(spec.api_version.clone()));
    }
    if spec.kind != KIND {
        return Err(ValidationError::Kind(spec.kind.clone()));
    }
    if spec.name.is_empty() || spec.name.len() > MAX_NAME_LEN || !NAME_RE.is_match(&spec.name) {
        return Err(ValidationError::Name(spec.name.clone()));
    }
    if !RUNTIME_RE.is_match(&spec.runtime) {
        return Err(ValidationError::Runtime(spec.runtime.clone()));
    }
    for cap in &spec.capabilities {
        if cap.len() > MAX_CAPABILITY_LEN || !CAPABILITY_RE.is_match(cap) {
            return Err(ValidationError::Capability(cap.clone()));
        }
    }
    if spec.environments.is_empty() {
        return Err(ValidationError::NoEnvironments);
    }
    for (env_name, env) in &spec.environments {
        if !ENV_NAME_RE.is_match(env_name) {
            return Err(ValidationError::EnvironmentName(env_name.clone()));
        }
        for (var_name, value) in &env.vars {
            if !VAR_NAME_RE.is_match(var_name) {
                return Err(ValidationError::VarName(var_name.clone(), env_name.clone()));
            }
            if value.len() > MAX_VALUE_BYTES {
                return Err(ValidationError::VarValueTooLarge(
                    var_name.clone(),
                    env_name.clone(),
                ));
            }
        }
    }
    // networkPolicies.{ingress,egress} are a closed enum (internal|none), so
    // deserialization itself rejects any other value; nothing further to check here.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnvironmentSpec, NetworkPolicies};
    use std::collections::BTreeMap;

    fn base_spec() -> ProjectSpec {
        let mut environments = BTreeMap::new();
        let mut vars = BTreeMap::new();
        vars.insert("LOG_LEVEL".to_string(), "info".to_string());
        environments.insert("dev".to_string(), EnvironmentSpec { vars });
        ProjectSpec {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: "svc-a".to_string(),
            runtime: "go_1.26".to_string(),
            capabilities: vec!["http".to_string()],
            environments,
            network_policies: NetworkPolicies::default(),
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(validate(&base_spec()).is_ok());
    }

    #[test]
    fn rejects_bad_name() {
        let mut spec = base_spec();
        spec.name = "Svc_A".to_string();
        assert!(matches!(validate(&spec), Err(ValidationError::Name(_))));
    }

    #[test]
    fn rejects_bad_var_name() {
        let mut spec = base_spec();
        spec.environments.get_mut("dev").unwrap().vars.insert(
            "log_level".to_string(),
            "info".to_string(),
        );
        assert!(matches!(validate(&spec), Err(ValidationError::VarName(_, _))));
    }

    #[test]
    fn rejects_oversized_value() {
        let mut spec = base_spec();
        spec.environments
            .get_mut("dev")
            .unwrap()
            .vars
            .insert("BIG".to_string(), "x".repeat(MAX_VALUE_BYTES + 1));
        assert!(matches!(
            validate(&spec),
            Err(ValidationError::VarValueTooLarge(_, _))
        ));
    }

    #[test]
    fn rejects_empty_environments() {
        let mut spec = base_spec();
        spec.environments.clear();
        assert!(matches!(validate(&spec), Err(ValidationError::NoEnvironments)));
    }
}
