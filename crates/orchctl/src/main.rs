//! orchctl - CLI client for orchd
//!
//! Control plane client for the platform orchestrator daemon.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use orch_core::RollbackScope;
use std::path::PathBuf;

/// CLI client for the orchd platform orchestrator daemon.
#[derive(Parser)]
#[command(name = "orchctl")]
#[command(about = "Control plane for orchd platform orchestrator")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:8080)
    #[arg(long, global = true, env = "ORCHD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "ORCHD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a new project from a spec file
    Register {
        /// Path to the project spec file (JSON or YAML)
        spec: PathBuf,
    },

    /// Update an existing project's spec
    Update {
        /// Project ID
        project_id: String,
        /// Path to the replacement spec file
        spec: PathBuf,
    },

    /// Delete a project
    Delete {
        /// Project ID
        project_id: String,
    },

    /// List projects
    List,

    /// Show detailed information about a project
    Inspect {
        /// Project ID
        project_id: String,
    },

    /// Deploy a project to an environment
    Deploy {
        /// Project ID
        project_id: String,
        /// Target environment
        environment: String,
    },

    /// Promote a delivered image from one environment to another
    Promote {
        /// Project ID
        project_id: String,
        /// Source environment
        from_env: String,
        /// Target environment
        to_env: String,
        /// Only preview the transition, do not enqueue it
        #[arg(long)]
        preview: bool,
    },

    /// Release a promoted image into an environment
    Release {
        /// Project ID
        project_id: String,
        /// Source environment
        from_env: String,
        /// Target environment
        to_env: String,
    },

    /// Roll an environment back to a prior release
    Rollback {
        /// Project ID
        project_id: String,
        /// Target release ID to roll back to
        target_release_id: String,
        /// Rollback scope: code-only, code-and-config, or full-state
        #[arg(long, value_parser = parse_rollback_scope)]
        scope: Option<RollbackScope>,
        /// Override a preview that is not ready
        #[arg(long)]
        force: bool,
        /// Only preview the rollback, do not enqueue it
        #[arg(long)]
        preview: bool,
    },

    /// List operations for a project
    Ops {
        /// Project ID
        project_id: String,
        /// Max number of operations to return
        #[arg(long)]
        limit: Option<usize>,
        /// Pagination cursor
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Show detailed information about an operation
    OpInspect {
        /// Operation ID
        op_id: String,
    },

    /// Stream live events from an operation
    Tail {
        /// Operation ID
        op_id: String,
        /// Keep streaming after a terminal event
        #[arg(short, long)]
        follow: bool,
    },

    /// List artifacts recorded for a project
    Artifacts {
        /// Project ID
        project_id: String,
    },

    /// Print the contents of a single artifact
    Artifact {
        /// Project ID
        project_id: String,
        /// Artifact path, relative to the project's artifact root
        path: String,
    },

    /// Show daemon configuration and runtime info
    System,
}

fn parse_rollback_scope(s: &str) -> Result<RollbackScope, String> {
    match s.to_lowercase().replace('_', "-").as_str() {
        "code-only" => Ok(RollbackScope::CodeOnly),
        "code-and-config" => Ok(RollbackScope::CodeAndConfig),
        "full-state" => Ok(RollbackScope::FullState),
        _ => Err(format!(
            "invalid rollback scope '{}', expected: code-only, code-and-config, full-state",
            s
        )),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli.addr.unwrap_or_else(|| "http://127.0.0.1:8080".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Register { spec } => run_register(&client, &spec).await,
        Command::Update { project_id, spec } => run_update(&client, &project_id, &spec).await,
        Command::Delete { project_id } => run_delete(&client, &project_id).await,
        Command::List => run_list(&client).await,
        Command::Inspect { project_id } => run_inspect(&client, &project_id).await,
        Command::Deploy { project_id, environment } => run_deploy(&client, &project_id, &environment).await,
        Command::Promote { project_id, from_env, to_env, preview } => {
            run_promote(&client, &project_id, &from_env, &to_env, preview).await
        }
        Command::Release { project_id, from_env, to_env } => {
            run_release(&client, &project_id, &from_env, &to_env).await
        }
        Command::Rollback { project_id, target_release_id, scope, force, preview } => {
            run_rollback(&client, &project_id, &target_release_id, scope, force, preview).await
        }
        Command::Ops { project_id, limit, cursor } => run_ops(&client, &project_id, limit, cursor).await,
        Command::OpInspect { op_id } => run_op_inspect(&client, &op_id).await,
        Command::Tail { op_id, follow } => client.tail_op(&op_id, follow).await,
        Command::Artifacts { project_id } => run_artifacts(&client, &project_id).await,
        Command::Artifact { project_id, path } => run_artifact(&client, &project_id, &path).await,
        Command::System => run_system(&client).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn read_spec_file(path: &std::path::Path) -> Result<serde_json::Value, ClientError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ClientError::IoError(format!("{}: {}", path.display(), e)))?;
    if path.extension().and_then(|s| s.to_str()) == Some("json") {
        serde_json::from_str(&content).map_err(|e| ClientError::IoError(format!("{}: {}", path.display(), e)))
    } else {
        serde_yaml::from_str(&content).map_err(|e| ClientError::IoError(format!("{}: {}", path.display(), e)))
    }
}

async fn run_register(client: &Client, spec_path: &std::path::Path) -> Result<(), ClientError> {
    let spec = read_spec_file(spec_path)?;
    let op = client.create_project(spec).await?;
    render::print_op_accepted(&op);
    Ok(())
}

async fn run_update(client: &Client, project_id: &str, spec_path: &std::path::Path) -> Result<(), ClientError> {
    let spec = read_spec_file(spec_path)?;
    let op = client.update_project(project_id, spec).await?;
    render::print_op_accepted(&op);
    Ok(())
}

async fn run_delete(client: &Client, project_id: &str) -> Result<(), ClientError> {
    let op = client.delete_project(project_id).await?;
    render::print_op_accepted(&op);
    Ok(())
}

async fn run_list(client: &Client) -> Result<(), ClientError> {
    let projects = client.list_projects().await?;
    render::print_project_list(&projects);
    Ok(())
}

async fn run_inspect(client: &Client, project_id: &str) -> Result<(), ClientError> {
    let project = client.get_project(project_id).await?;
    render::print_project_details(&project);
    Ok(())
}

async fn run_deploy(client: &Client, project_id: &str, environment: &str) -> Result<(), ClientError> {
    let op = client.deploy(project_id, environment).await?;
    render::print_op_accepted(&op);
    Ok(())
}

async fn run_promote(
    client: &Client,
    project_id: &str,
    from_env: &str,
    to_env: &str,
    preview: bool,
) -> Result<(), ClientError> {
    if preview {
        let preview = client.promote_preview(project_id, from_env, to_env).await?;
        println!("{}", serde_json::to_string_pretty(&preview).unwrap_or_default());
        return Ok(());
    }
    let op = client.promote(project_id, from_env, to_env).await?;
    render::print_op_accepted(&op);
    Ok(())
}

async fn run_release(client: &Client, project_id: &str, from_env: &str, to_env: &str) -> Result<(), ClientError> {
    let op = client.release(project_id, from_env, to_env).await?;
    render::print_op_accepted(&op);
    Ok(())
}

async fn run_rollback(
    client: &Client,
    project_id: &str,
    target_release_id: &str,
    scope: Option<RollbackScope>,
    force: bool,
    preview: bool,
) -> Result<(), ClientError> {
    if preview {
        let preview = client.rollback_preview(project_id, target_release_id, scope, force).await?;
        println!("{}", serde_json::to_string_pretty(&preview).unwrap_or_default());
        return Ok(());
    }
    let op = client.rollback(project_id, target_release_id, scope, force).await?;
    render::print_op_accepted(&op);
    Ok(())
}

async fn run_ops(
    client: &Client,
    project_id: &str,
    limit: Option<usize>,
    cursor: Option<String>,
) -> Result<(), ClientError> {
    let page = client.list_ops(project_id, limit, cursor.as_deref(), None).await?;
    render::print_op_list(&page.ops, page.next_cursor.as_deref());
    Ok(())
}

async fn run_op_inspect(client: &Client, op_id: &str) -> Result<(), ClientError> {
    let op = client.get_op(op_id).await?;
    render::print_op_details(&op);
    Ok(())
}

async fn run_artifacts(client: &Client, project_id: &str) -> Result<(), ClientError> {
    let files = client.list_artifacts(project_id).await?;
    if files.is_empty() {
        println!("No artifacts found.");
        return Ok(());
    }
    for file in &files {
        println!("{}", file);
    }
    println!();
    println!("{} artifact(s)", files.len());
    Ok(())
}

async fn run_artifact(client: &Client, project_id: &str, path: &str) -> Result<(), ClientError> {
    let bytes = client.get_artifact(project_id, path).await?;
    std::io::Write::write_all(&mut std::io::stdout(), &bytes)
        .map_err(|e| ClientError::IoError(e.to_string()))?;
    Ok(())
}

async fn run_system(client: &Client) -> Result<(), ClientError> {
    let info = client.system_info().await?;
    println!("{}", serde_json::to_string_pretty(&info).unwrap_or_default());
    Ok(())
}
