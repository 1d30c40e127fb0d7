//! Line console used by `feedwatch serve`.
//!
//! Each stdin line is one command. Parsing is separate from execution so
//! the grammar can be tested without a running controller.

use std::sync::Arc;

use feedwatch_core::{PipelineController, RunSnapshot};
use feedwatch_shared::{
    DecisionOutcome, MAX_LOOKBACK_DAYS, MIN_LOOKBACK_DAYS, RefreshRequest, RefreshStatus, Stage,
};
use tokio::sync::watch;
use tracing::info;

pub(crate) const HELP: &str = "commands: status | refresh [days] [--since-last] | approve | \
decline | dismiss | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConsoleCommand {
    Status,
    Refresh(RefreshRequest),
    Approve,
    Decline,
    Dismiss,
    Help,
    Quit,
}

/// Parse one console line. `Ok(None)` for blank input.
pub(crate) fn parse_line(
    line: &str,
    default: RefreshRequest,
) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "status" | "s" => ConsoleCommand::Status,
        "approve" | "y" | "yes" => ConsoleCommand::Approve,
        "decline" | "n" | "no" => ConsoleCommand::Decline,
        "dismiss" => ConsoleCommand::Dismiss,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        "refresh" | "r" => {
            let mut lookback_days = default.lookback_days;
            let mut since_last_fetch = default.since_last_fetch;
            for word in words {
                if word == "--since-last" {
                    since_last_fetch = true;
                } else {
                    lookback_days = word
                        .parse::<u32>()
                        .map_err(|_| format!("invalid lookback '{word}'"))?;
                }
            }
            let request = RefreshRequest::new(lookback_days, since_last_fetch).map_err(|_| {
                format!("lookback must be between {MIN_LOOKBACK_DAYS} and {MAX_LOOKBACK_DAYS} days")
            })?;
            ConsoleCommand::Refresh(request)
        }
        other => return Err(format!("unknown command '{other}'. {HELP}")),
    };
    Ok(Some(command))
}

/// Execute a command. Returns the reply to print, or `None` to quit.
pub(crate) fn execute(controller: &Arc<PipelineController>, command: ConsoleCommand) -> Option<String> {
    let reply = match command {
        ConsoleCommand::Status => render_status(&controller.status()),
        ConsoleCommand::Refresh(request) => {
            let outcome = controller.trigger(request);
            match outcome.run_id {
                Some(run_id) if outcome.started => format!(
                    "started {run_id} (lookback {} days{})",
                    request.lookback_days,
                    if request.since_last_fetch { ", since last fetch" } else { "" }
                ),
                _ => "a refresh is already running".to_string(),
            }
        }
        ConsoleCommand::Approve => decision_reply(controller.approve(), "approved"),
        ConsoleCommand::Decline => decision_reply(controller.decline(), "declined"),
        ConsoleCommand::Dismiss => {
            if controller.dismiss_actual_cost() {
                "cost report dismissed".to_string()
            } else {
                "no cost report to dismiss".to_string()
            }
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => return None,
    };
    Some(reply)
}

fn decision_reply(outcome: DecisionOutcome, verb: &str) -> String {
    match outcome {
        DecisionOutcome::Accepted => format!("summarization {verb}"),
        DecisionOutcome::NoPendingDecision => "nothing is waiting for approval".to_string(),
        DecisionOutcome::StaleRun => "that estimate belongs to a finished run".to_string(),
    }
}

pub(crate) fn render_status(status: &RefreshStatus) -> String {
    let mut out = match (status.is_refreshing, status.stage, status.run_id) {
        (true, Some(stage), Some(run_id)) => format!("{run_id}: {stage}"),
        (false, Some(stage), Some(run_id)) => format!("idle (last {run_id} ended in {stage})"),
        _ => "idle".to_string(),
    };
    if let Some(estimate) = &status.cost_estimate {
        out.push_str(&format!(
            "\n  estimate: ${:.4} for {} articles with {} (approve or decline)",
            estimate.estimated_cost, estimate.pending_item_count, estimate.model
        ));
    }
    if let Some(actual) = &status.actual_cost {
        out.push_str(&format!(
            "\n  last summarize: ${:.4} for {} articles ({} in / {} out tokens, {})",
            actual.actual_cost,
            actual.item_count,
            actual.input_tokens,
            actual.output_tokens,
            actual.model
        ));
    }
    out
}

/// Log stage transitions and print estimates and cost reports as they
/// appear. Ends when the controller is dropped.
pub(crate) async fn announce(mut rx: watch::Receiver<RunSnapshot>) {
    let mut last = rx.borrow_and_update().clone();
    while rx.changed().await.is_ok() {
        let current = rx.borrow_and_update().clone();
        if current.stage != last.stage {
            if let (Some(stage), Some(run_id)) = (current.stage, current.run_id) {
                info!(%run_id, %stage, "stage changed");
                if let (Stage::Error, Some(err)) = (stage, &current.last_error) {
                    println!("{run_id} failed: {err}");
                }
            }
        }
        if current.cost_estimate != last.cost_estimate {
            if let Some(estimate) = &current.cost_estimate {
                println!(
                    "{}: summarizing {} articles with {} will cost about ${:.4}. \
                     Type 'approve' or 'decline'.",
                    estimate.run_id,
                    estimate.pending_item_count,
                    estimate.model,
                    estimate.estimated_cost
                );
            }
        }
        if current.actual_cost != last.actual_cost {
            if let Some(actual) = &current.actual_cost {
                println!(
                    "{}: summarized {} articles for ${:.4}",
                    actual.run_id, actual.item_count, actual.actual_cost
                );
            }
        }
        last = current;
    }
}
