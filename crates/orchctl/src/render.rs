//! Output rendering for orchctl CLI.
//!
//! Formats project and operation information for terminal display.

use orch_core::{OpKind, OpStatus, Operation, Project, ProjectPhase};

/// Print confirmation after an event endpoint enqueues an op.
pub fn print_op_accepted(op: &Operation) {
    println!("Queued {} op: {}", format_kind(op.kind), op.id);
    println!("  Project: {}", op.project_id);
    println!("  Status:  {}", format_op_status(op.status));
}

pub fn print_project_list(projects: &[Project]) {
    if projects.is_empty() {
        println!("No projects found.");
        return;
    }

    println!("{:<38}  {:<20}  {:<14}  {:<20}", "ID", "NAME", "PHASE", "UPDATED");
    println!("{}", "-".repeat(96));

    for project in projects {
        println!(
            "{:<38}  {:<20}  {:<14}  {:<20}",
            project.id,
            truncate(&project.spec.name, 20),
            format_phase(project.status.phase),
            format_time(&project.status.updated_at),
        );
    }

    println!();
    println!("{} project(s)", projects.len());
}

pub fn print_project_details(project: &Project) {
    println!("Project: {}", project.id);
    println!();
    println!("  Name:     {}", project.spec.name);
    println!("  Runtime:  {}", project.spec.runtime);
    println!("  Phase:    {}", format_phase(project.status.phase));
    println!("  Message:  {}", project.status.message);
    if !project.spec.capabilities.is_empty() {
        println!("  Capabilities: {}", project.spec.capabilities.join(", "));
    }
    println!();
    println!("  Environments:");
    for (name, env) in &project.spec.environments {
        println!("    {} ({} var(s))", name, env.vars.len());
    }
    println!();
    println!(
        "  Network policies: ingress={} egress={}",
        project.spec.network_policies.ingress.as_str(),
        project.spec.network_policies.egress.as_str()
    );
    println!();
    println!("  Created: {}", format_time(&project.created_at));
    println!("  Updated: {}", format_time(&project.updated_at));
}

pub fn print_op_list(ops: &[Operation], next_cursor: Option<&str>) {
    if ops.is_empty() {
        println!("No operations found.");
        return;
    }

    println!("{:<38}  {:<10}  {:<10}  {:<20}", "ID", "KIND", "STATUS", "REQUESTED");
    println!("{}", "-".repeat(84));

    for op in ops {
        println!(
            "{:<38}  {:<10}  {:<10}  {:<20}",
            op.id,
            format_kind(op.kind),
            format_op_status(op.status),
            format_time(&op.requested),
        );
    }

    println!();
    println!("{} operation(s)", ops.len());
    if let Some(cursor) = next_cursor {
        println!("next cursor: {}", cursor);
    }
}

pub fn print_op_details(op: &Operation) {
    println!("Operation: {}", op.id);
    println!();
    println!("  Kind:      {}", format_kind(op.kind));
    println!("  Project:   {}", op.project_id);
    println!("  Status:    {}", format_op_status(op.status));
    if let Some(delivery) = &op.delivery {
        println!("  Delivery:  {} -> {}", delivery.stage.as_str(), delivery.environment);
        if let (Some(from), Some(to)) = (&delivery.from_env, &delivery.to_env) {
            println!("             ({} -> {})", from, to);
        }
    }
    if let Some(error) = &op.error {
        println!("  Error:     {}", error);
    }
    println!();
    println!("  Requested: {}", format_time(&op.requested));
    if let Some(finished) = &op.finished {
        println!("  Finished:  {}", format_time(finished));
    }

    if !op.steps.is_empty() {
        println!();
        println!("  Steps:");
        println!("    {:<20}  {:<10}  {:<20}  {}", "WORKER", "STATE", "STARTED", "MESSAGE");
        println!("    {}", "-".repeat(90));
        for step in &op.steps {
            let state = if step.error.is_some() {
                "FAILED"
            } else if step.ended_at.is_some() {
                "DONE"
            } else {
                "RUNNING"
            };
            println!(
                "    {:<20}  {:<10}  {:<20}  {}",
                step.worker,
                state,
                format_time(&step.started_at),
                step.error.as_deref().unwrap_or(&step.message),
            );
        }
    }
}

fn format_kind(kind: OpKind) -> &'static str {
    kind.as_str()
}

fn format_op_status(status: OpStatus) -> &'static str {
    match status {
        OpStatus::Queued => "QUEUED",
        OpStatus::Running => "RUNNING",
        OpStatus::Done => "DONE",
        OpStatus::Error => "ERROR",
    }
}

fn format_phase(phase: ProjectPhase) -> &'static str {
    match phase {
        ProjectPhase::Reconciling => "RECONCILING",
        ProjectPhase::Ready => "READY",
        ProjectPhase::Deleting => "DELETING",
        ProjectPhase::Error => "ERROR",
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}
