//! Run commands: `stagehand start | advance | approve | deploy | reject |
//! fail | retry | show | events`.

use anyhow::{Context, Result};

use stagehand::config::StagehandConfig;
use stagehand::errors::RunError;
use stagehand::orchestrator::RunService;
use stagehand::run::{Run, RunEvent, RunId, WorkflowState};

fn open_service(config: &StagehandConfig) -> Result<RunService> {
    RunService::from_config(config)
}

fn parse_id(raw: &str) -> Result<RunId> {
    raw.parse::<RunId>().map_err(anyhow::Error::msg)
}

/// Stage failures leave the run in place; point the operator at `retry`.
fn with_retry_hint(id: &str, err: RunError) -> anyhow::Error {
    if err.is_retryable() {
        eprintln!(
            "{} the run was left in its current state. Run 'stagehand retry {}' to try again.",
            console::style("hint:").cyan().bold(),
            id
        );
    }
    err.into()
}

fn styled_state(state: WorkflowState) -> console::StyledObject<&'static str> {
    let style = console::style(state.as_str()).bold();
    match state {
        WorkflowState::Done => style.green(),
        WorkflowState::Fail => style.red(),
        WorkflowState::WaitingForApproval => style.yellow(),
        _ => style.cyan(),
    }
}

fn print_run_summary(run: &Run) {
    println!("{} {}", console::style("Run").bold(), run.id());
    println!("  state:   {}", styled_state(run.state()));
    if let Some(name) = run.project_name() {
        println!("  project: {}", name);
    }
    if run.retry_count() > 0 {
        println!("  retries: {}", run.retry_count());
    }
    if let Some(summary) = run.approval_summary() {
        println!("  {} {}", console::style("Awaiting approval:").yellow(), summary);
    }
    if let Some(reason) = run.failure_reason() {
        let kind = run.failure_kind().map(|k| k.as_str()).unwrap_or("system");
        println!("  {} ({}) {}", console::style("Failed:").red().bold(), kind, reason);
    }
}

fn print_event(event: &RunEvent) {
    println!(
        "  {:>4}  {}  {:<18} {}",
        event.seq,
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        event.event_type.as_str(),
        console::style(event.payload.to_string()).dim()
    );
}

pub async fn cmd_start(config: &StagehandConfig, prompt: &str, project_name: Option<&str>) -> Result<()> {
    let service = open_service(config)?;
    let run = service.start_run(prompt, project_name).await?;
    print_run_summary(&run);
    Ok(())
}

pub async fn cmd_advance(config: &StagehandConfig, id: &str) -> Result<()> {
    let service = open_service(config)?;
    let run = service
        .advance_run(parse_id(id)?)
        .await
        .map_err(|e| with_retry_hint(id, e))?;
    print_run_summary(&run);
    Ok(())
}

pub async fn cmd_approve(config: &StagehandConfig, id: &str) -> Result<()> {
    let service = open_service(config)?;
    let run = service.approve_run(parse_id(id)?).await?;
    print_run_summary(&run);
    Ok(())
}

pub async fn cmd_deploy(config: &StagehandConfig, id: &str) -> Result<()> {
    let service = open_service(config)?;
    let run = service
        .deploy_run(parse_id(id)?)
        .await
        .map_err(|e| with_retry_hint(id, e))?;
    print_run_summary(&run);
    Ok(())
}

pub async fn cmd_reject(config: &StagehandConfig, id: &str, reason: &str) -> Result<()> {
    let service = open_service(config)?;
    let run = service.reject_run(parse_id(id)?, reason).await?;
    print_run_summary(&run);
    Ok(())
}

pub async fn cmd_fail(config: &StagehandConfig, id: &str, reason: &str) -> Result<()> {
    let service = open_service(config)?;
    let run = service.fail_run(parse_id(id)?, reason).await?;
    print_run_summary(&run);
    Ok(())
}

pub async fn cmd_retry(config: &StagehandConfig, id: &str) -> Result<()> {
    let service = open_service(config)?;
    let run = service
        .retry_run(parse_id(id)?)
        .await
        .map_err(|e| with_retry_hint(id, e))?;
    print_run_summary(&run);
    Ok(())
}

pub async fn cmd_show(config: &StagehandConfig, id: &str, json: bool) -> Result<()> {
    let service = open_service(config)?;
    let details = service.get_run(parse_id(id)?).await?;

    if json {
        let doc = serde_json::to_string_pretty(&details).context("Failed to serialize run")?;
        println!("{}", doc);
        return Ok(());
    }

    let run = &details.run;
    print_run_summary(run);
    println!("  prompt:  {}", run.prompt());
    println!("  created: {}", run.created_at().to_rfc3339());
    println!("  updated: {}", run.updated_at().to_rfc3339());

    if !run.artifacts().is_empty() {
        println!();
        println!("{}", console::style("Artifacts").bold());
        for artifact in run.artifacts() {
            println!("  {:<12} {}", artifact.step.as_str(), artifact.path);
        }
    }
    if !run.step_durations().is_empty() {
        println!();
        println!("{}", console::style("Step durations").bold());
        for duration in run.step_durations() {
            println!("  {:<22} {} ms", duration.step.as_str(), duration.duration_ms);
        }
    }
    if !details.recent_events.is_empty() {
        println!();
        println!("{}", console::style("Recent events").bold());
        for event in &details.recent_events {
            print_event(event);
        }
    }
    Ok(())
}

pub async fn cmd_events(config: &StagehandConfig, id: &str, limit: usize) -> Result<()> {
    let service = open_service(config)?;
    let events = service.latest_events(parse_id(id)?, limit).await?;
    if events.is_empty() {
        println!("No events recorded.");
        return Ok(());
    }
    for event in &events {
        print_event(event);
    }
    Ok(())
}
