//! Job inspection: one job row plus its context lineage and children.

use anyhow::{Context, Result};
use ductile_ids::EventContextId;
use ductile_sentinel::OrchestratorConfig;
use ductile_state_store::{ContextStore, EventContext, JobQueue, JobRecord, QueueStore};

pub async fn report(config: OrchestratorConfig, job_id: &str, as_json: bool) -> Result<()> {
    let db = ductile_db::open_pool(&config.state_db_path())
        .await
        .context("Failed to open control-plane database")?;
    ductile_db::init_schema(&db).await?;
    let queue = JobQueue::new(db.clone(), config.retry_policy());
    let contexts = ContextStore::new(db);

    let job = queue.get(job_id).await?;
    let lineage = match &job.event_context_id {
        None => Vec::new(),
        Some(id) => {
            contexts
                .lineage(&EventContextId::from_string(id.clone()))
                .await?
        }
    };
    let children = queue.children_of(job_id).await?;

    if as_json {
        let report = serde_json::json!({
            "job": job,
            "lineage": lineage,
            "children": children,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&job, &lineage, &children);
    }
    Ok(())
}

fn print_text(job: &JobRecord, lineage: &[EventContext], children: &[JobRecord]) {
    println!("Job       {}", job.id);
    println!("Plugin    {} ({})", job.plugin, job.command);
    println!("Status    {} (attempt {})", job.status, job.attempt);
    println!("Submitted {} by {}", job.created_at, display_or(&job.submitted_by, "-"));
    if let Some(parent) = &job.parent_job_id {
        println!("Parent    {}", parent);
    }
    if let Some(event) = &job.source_event_id {
        println!("Event     {}", event);
    }
    if let Some(err) = &job.last_error {
        println!("Error     {}", err);
    }

    if !lineage.is_empty() {
        println!();
        println!("Lineage ({} hop(s), root first):", lineage.len());
        for ctx in lineage {
            let baggage = serde_json::to_string(&ctx.accumulated).unwrap_or_default();
            println!("  {}/{}  {}", ctx.pipeline_name, ctx.step_id, baggage);
        }
    }

    if !children.is_empty() {
        println!();
        println!("Children:");
        for child in children {
            println!("  {}  {} ({})", child.id, child.plugin, child.status);
        }
    }
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}
