//! Git plumbing for the `repoBootstrap` step worker (Section 4.5): ensures
//! local working trees exist on `main` with bot identity, installs webhook
//! hooks, and classifies branches/commit messages for CI gating.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Commit messages with this prefix must not retrigger CI (Section 6, Glossary).
pub const SKIP_MARKER: &str = "platform-sync:";
const BOT_NAME: &str = "platform-orchestrator";
const BOT_EMAIL: &str = "orchestrator@platform.local";

fn run_git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(repo).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {stderr}",
            args.join(" ")
        )));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

/// Ensure `repo_dir` is an initialized git repository on `main` with bot
/// identity configured. Returns whether the repo was freshly created.
/// Idempotent: a no-op (beyond re-asserting identity) if already initialized.
pub fn ensure_repo(repo_dir: &Path) -> Result<bool> {
    let created = !repo_dir.join(".git").exists();
    if created {
        std::fs::create_dir_all(repo_dir)?;
        if run_git(repo_dir, &["init", "--initial-branch=main"]).is_err() {
            run_git(repo_dir, &["init"])?;
            run_git(repo_dir, &["checkout", "-b", "main"])?;
        }
    }
    run_git(repo_dir, &["config", "user.name", BOT_NAME])?;
    run_git(repo_dir, &["config", "user.email", BOT_EMAIL])?;
    Ok(created)
}

/// Stage everything and commit if the tree is dirty; no-op otherwise.
/// Returns the new HEAD sha when a commit was made.
pub fn commit_all_if_dirty(repo_dir: &Path, message: &str) -> Result<Option<String>> {
    run_git(repo_dir, &["add", "-A"])?;
    let status = run_git(repo_dir, &["status", "--porcelain"])?;
    if status.is_empty() {
        return Ok(None);
    }
    run_git(repo_dir, &["commit", "-m", message])?;
    Ok(Some(run_git(repo_dir, &["rev-parse", "HEAD"])?))
}

/// Current HEAD sha, or `None` for a repo with no commits yet.
pub fn current_head(repo_dir: &Path) -> Option<String> {
    run_git(repo_dir, &["rev-parse", "HEAD"]).ok()
}

/// Strip `refs/heads/`/`heads/` and lowercase (Section 6 webhook gating,
/// Section 8 "Branch classification").
pub fn normalize_branch_ref(value: &str) -> String {
    let trimmed = value.trim();
    let stripped = trimmed
        .strip_prefix("refs/heads/")
        .or_else(|| trimmed.strip_prefix("heads/"))
        .unwrap_or(trimmed);
    stripped.to_lowercase()
}

/// `isMainBranch` (Section 8 round-trip law).
pub fn is_main_branch(value: &str) -> bool {
    normalize_branch_ref(value) == "main"
}

/// `shouldSkipSourceCommit` (Section 8).
pub fn should_skip_source_commit(message: &str) -> bool {
    message.trim_start().to_lowercase().starts_with(SKIP_MARKER)
}

/// Write (upsert-if-different) the post-commit/post-merge hooks that POST a
/// source-webhook payload to the local API for `main`-branch, non-skip-marked
/// commits (Section 4.5, Section 6). Returns the hook names actually written.
pub fn install_webhook_hooks(
    repo_dir: &Path,
    local_api_base_url: &str,
    project_id: &str,
) -> Result<Vec<String>> {
    let hooks_dir = repo_dir.join(".git").join("hooks");
    std::fs::create_dir_all(&hooks_dir)?;
    let script = webhook_hook_script(local_api_base_url, project_id);

    let mut written = Vec::new();
    for hook_name in ["post-commit", "post-merge"] {
        let path = hooks_dir.join(hook_name);
        let needs_write = std::fs::read_to_string(&path).map(|existing| existing != script).unwrap_or(true);
        if needs_write {
            std::fs::write(&path, &script)?;
            set_executable(&path)?;
            written.push(hook_name.to_string());
        }
    }
    Ok(written)
}

fn webhook_hook_script(local_api_base_url: &str, project_id: &str) -> String {
    format!(
        "#!/bin/sh\n\
         branch=$(git rev-parse --abbrev-ref HEAD)\n\
         commit=$(git rev-parse HEAD)\n\
         message=$(git log -1 --pretty=%B)\n\
         case \"$message\" in\n  {SKIP_MARKER}*) exit 0 ;;\nesac\n\
         if [ \"$branch\" != \"main\" ]; then\n  exit 0\nfi\n\
         curl -fsS -X POST \"{local_api_base_url}/api/webhooks/source\" \\\n  \
         -H 'Content-Type: application/json' \\\n  \
         -d \"{{\\\"project_id\\\":\\\"{project_id}\\\",\\\"repo\\\":\\\"source\\\",\\\"branch\\\":\\\"$branch\\\",\\\"commit\\\":\\\"$commit\\\"}}\" \\\n  \
         >/dev/null 2>&1 || true\n"
    )
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(GitError::Execution)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_repo_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("source");
        assert!(ensure_repo(&repo).unwrap());
        assert!(!ensure_repo(&repo).unwrap());
    }

    #[test]
    fn commit_all_if_dirty_commits_once() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("manifests");
        ensure_repo(&repo).unwrap();
        std::fs::write(repo.join("kustomization.yaml"), "resources: []\n").unwrap();

        let first = commit_all_if_dirty(&repo, "platform-sync: init").unwrap();
        assert!(first.is_some());
        let second = commit_all_if_dirty(&repo, "platform-sync: init").unwrap();
        assert!(second.is_none(), "clean tree must not produce a new commit");
    }

    #[test]
    fn is_main_branch_normalizes_ref_forms() {
        assert!(is_main_branch("refs/heads/main"));
        assert!(is_main_branch("main"));
        assert!(is_main_branch("heads/main"));
        assert!(is_main_branch("MAIN"));
        assert!(!is_main_branch("refs/heads/dev"));
    }

    #[test]
    fn should_skip_source_commit_matches_prefix() {
        assert!(should_skip_source_commit("  platform-sync: render overlays"));
        assert!(should_skip_source_commit("Platform-Sync: case insensitive"));
        assert!(!should_skip_source_commit("fix: regular commit"));
    }

    #[test]
    fn install_webhook_hooks_is_upsert_if_different() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("source");
        ensure_repo(&repo).unwrap();

        let written = install_webhook_hooks(&repo, "http://127.0.0.1:8080", "proj-1").unwrap();
        assert_eq!(written, vec!["post-commit", "post-merge"]);

        let rewritten = install_webhook_hooks(&repo, "http://127.0.0.1:8080", "proj-1").unwrap();
        assert!(rewritten.is_empty(), "identical script must not be rewritten");

        let changed = install_webhook_hooks(&repo, "http://127.0.0.1:9090", "proj-1").unwrap();
        assert_eq!(changed, vec!["post-commit", "post-merge"]);
    }

    #[test]
    fn current_head_is_none_before_first_commit() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("empty");
        ensure_repo(&repo).unwrap();
        assert!(current_head(&repo).is_none());
    }
}
