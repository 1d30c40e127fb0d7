//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, bail, eyre};
use feedwatch_core::{
    AcceptAll, FALLBACK_PRICING, FeedSource, PipelineController, PipelineStages, RelevanceFilter,
    SessionCostAccountant, estimate_summarization_cost, lookup_pricing, matching_entry,
    spawn_scheduler,
};
use feedwatch_extract::{ArticleScraper, FileUrlCleanup};
use feedwatch_feeds::{FeedFetcher, MalpediaFetcher};
use feedwatch_llm::{LlmClient, Summarizer, SummaryEmbedder, TitleRelevance};
use feedwatch_shared::{
    AppConfig, CostDecision, PipelineConfig, RefreshRequest, Stage, database_path, init_config,
    load_config, validate_api_key,
};
use feedwatch_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::console::{self, ConsoleCommand};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// feedwatch: security news feeds, summarized behind a cost checkpoint.
#[derive(Parser)]
#[command(
    name = "feedwatch",
    version,
    about = "Fetch, scrape, summarize, and embed security news with a cost-approval checkpoint.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the periodic scheduler with an interactive console on stdin.
    Serve {
        /// Minutes between scheduled refreshes (overrides config).
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Run the pipeline once and exit.
    Run {
        /// Accept feed entries up to this many days old (1-365).
        #[arg(short, long)]
        days: Option<u32>,

        /// Only accept entries newer than each feed's last fetch.
        #[arg(long)]
        since_last: bool,

        /// Approve the cost estimate without prompting.
        #[arg(long, conflicts_with = "decline")]
        yes: bool,

        /// Skip summarization without prompting.
        #[arg(long)]
        decline: bool,
    },

    /// Estimate the cost of summarizing a number of articles.
    Estimate {
        /// Number of articles waiting for summarization.
        #[arg(long)]
        pending: usize,

        /// Model to price against (defaults to the configured model).
        #[arg(long)]
        model: Option<String>,
    },

    /// Show the token prices a model name resolves to.
    Pricing {
        /// Model name, e.g. gpt-4o-mini.
        model: String,
    },

    /// Show article counts from the database.
    Stats,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "feedwatch=info",
        1 => "feedwatch=debug",
        _ => "feedwatch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve { interval } => cmd_serve(interval).await,
        Command::Run {
            days,
            since_last,
            yes,
            decline,
        } => {
            let preset = match (yes, decline) {
                (true, _) => Some(CostDecision::Approved),
                (_, true) => Some(CostDecision::Declined),
                _ => None,
            };
            cmd_run(days, since_last, preset).await
        }
        Command::Estimate { pending, model } => cmd_estimate(pending, model),
        Command::Pricing { model } => cmd_pricing(&model),
        Command::Stats => cmd_stats().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Open storage and assemble the controller with the real stages.
async fn build_controller(config: &AppConfig) -> Result<Arc<PipelineController>> {
    let db_path = database_path(config)?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| eyre!("cannot create {}: {e}", parent.display()))?;
    }
    let storage = Arc::new(Storage::open(&db_path).await?);

    let accountant = Arc::new(SessionCostAccountant::new());
    let llm = Arc::new(LlmClient::new(config.llm.clone(), Arc::clone(&accountant))?);
    if let Err(e) = validate_api_key(config) {
        warn!(error = %e, "summarization will be skipped");
    }

    let relevance: Arc<dyn RelevanceFilter> = if config.llm.relevance_filter {
        Arc::new(TitleRelevance::new(Arc::clone(&llm)))
    } else {
        Arc::new(AcceptAll)
    };
    let feeds = FeedFetcher::new(Arc::clone(&storage), config.feeds.clone())?
        .with_relevance(Arc::clone(&relevance));
    let malpedia = MalpediaFetcher::new(Arc::clone(&storage), config.malpedia.clone())?
        .with_relevance(relevance);

    let stages = PipelineStages {
        cleanup: Arc::new(FileUrlCleanup::new(Arc::clone(&storage))),
        sources: vec![
            Arc::new(feeds) as Arc<dyn FeedSource>,
            Arc::new(malpedia) as Arc<dyn FeedSource>,
        ],
        extractor: Arc::new(ArticleScraper::new(Arc::clone(&storage))?),
        enricher: Arc::new(Summarizer::new(Arc::clone(&llm), Arc::clone(&storage))),
        embedder: Arc::new(SummaryEmbedder::new(Arc::clone(&llm), Arc::clone(&storage))),
        provider: llm,
    };

    info!(db = %db_path.display(), feeds = config.feeds.len(), "pipeline ready");
    Ok(PipelineController::new(
        stages,
        PipelineConfig::from(config),
        accountant,
    ))
}

fn scheduled_request(config: &AppConfig) -> RefreshRequest {
    RefreshRequest::clamped(
        i64::from(config.schedule.lookback_days),
        config.schedule.since_last_fetch,
    )
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_serve(interval: Option<u64>) -> Result<()> {
    let config = load_config()?;
    let controller = build_controller(&config).await?;

    let minutes = interval.unwrap_or(config.schedule.fetch_interval_minutes);
    if minutes == 0 {
        bail!("refresh interval must be at least one minute");
    }
    let request = scheduled_request(&config);
    let scheduler = spawn_scheduler(
        Arc::clone(&controller),
        Duration::from_secs(minutes * 60),
        request,
    );
    tokio::spawn(console::announce(controller.subscribe()));

    println!("feedwatch serving, refresh every {minutes} min. {}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    // Detached stdin: keep serving until interrupted.
                    tokio::signal::ctrl_c().await?;
                    break;
                };
                match console::parse_line(&line, request) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Some(reply) = console::execute(&controller, command) {
                            println!("{reply}");
                        }
                    }
                    Err(message) => println!("{message}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    scheduler.stop();
    if controller.status().is_refreshing {
        info!("waiting for the active run to finish");
        controller.wait_until_idle().await;
    }
    Ok(())
}

async fn cmd_run(days: Option<u32>, since_last: bool, preset: Option<CostDecision>) -> Result<()> {
    let config = load_config()?;
    let request = match days {
        Some(days) => RefreshRequest::new(days, since_last)?,
        None => RefreshRequest {
            since_last_fetch: since_last || config.schedule.since_last_fetch,
            ..scheduled_request(&config)
        },
    };
    let controller = build_controller(&config).await?;

    let mut rx = controller.subscribe();
    let outcome = controller.trigger(request);
    let Some(run_id) = outcome.run_id else {
        bail!("a refresh is already running");
    };

    let spinner = spinner();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut asked = false;
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if let Some(stage) = snapshot.stage {
            spinner.set_message(format!("{run_id}: {stage}"));
        }
        if !snapshot.active {
            break;
        }

        if let (Some(Stage::Confirm), Some(estimate), false) =
            (snapshot.stage, &snapshot.cost_estimate, asked)
        {
            asked = true;
            let decision = match preset {
                Some(decision) => Some(decision),
                None => {
                    spinner.suspend(|| {
                        println!(
                            "Summarizing {} articles with {} will cost about ${:.4}.",
                            estimate.pending_item_count, estimate.model, estimate.estimated_cost
                        );
                        println!(
                            "Proceed? [y/n] (continues automatically after {}s)",
                            config.pipeline.approval_timeout_secs
                        );
                    });
                    tokio::select! {
                        line = lines.next_line() => match line? {
                            Some(answer) => Some(parse_answer(&answer)),
                            None => None,
                        },
                        _ = rx.wait_for(|s| s.stage != Some(Stage::Confirm)) => None,
                    }
                }
            };
            if let Some(decision) = decision {
                let result = controller.decide_for(run_id, decision);
                info!(?decision, ?result, "decision delivered");
            }
            continue;
        }

        if rx.changed().await.is_err() {
            break;
        }
    }

    let last = controller.wait_until_idle().await;
    spinner.finish_and_clear();

    let path: Vec<&str> = last.history.iter().map(Stage::as_str).collect();
    println!();
    println!("  Run:     {run_id}");
    println!("  Stages:  {}", path.join(" -> "));
    if let Some(actual) = &last.actual_cost {
        println!(
            "  Cost:    ${:.4} for {} articles ({} in / {} out tokens, {})",
            actual.actual_cost,
            actual.item_count,
            actual.input_tokens,
            actual.output_tokens,
            actual.model
        );
    }
    println!();

    match (last.stage, last.last_error) {
        (Some(Stage::Error), Some(err)) => Err(eyre!("run failed: {err}")),
        (Some(Stage::Error), None) => Err(eyre!("run failed")),
        _ => Ok(()),
    }
}

fn parse_answer(answer: &str) -> CostDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "approve" => CostDecision::Approved,
        _ => CostDecision::Declined,
    }
}

fn cmd_estimate(pending: usize, model: Option<String>) -> Result<()> {
    let model = match model {
        Some(model) => model,
        None => load_config()?.llm.active_model().to_string(),
    };
    let cost = estimate_summarization_cost(pending, &model);
    println!("Estimated cost for {pending} articles with {model}: ${cost:.4}");
    Ok(())
}

fn cmd_pricing(model: &str) -> Result<()> {
    let pricing = lookup_pricing(model);
    match matching_entry(model) {
        Some(entry) => println!("{model} matches '{}'", entry.match_key),
        None => println!(
            "{model} is not in the pricing table, using fallback prices \
             (${:.2}/M in, ${:.2}/M out)",
            FALLBACK_PRICING.input_price_per_million, FALLBACK_PRICING.output_price_per_million
        ),
    }
    println!("  input:  ${:.2} per million tokens", pricing.input_price_per_million);
    println!("  output: ${:.2} per million tokens", pricing.output_price_per_million);
    Ok(())
}

async fn cmd_stats() -> Result<()> {
    let config = load_config()?;
    let db_path = database_path(&config)?;
    let storage = Storage::open_readonly(&db_path).await?;
    let stats = storage.stats().await?;

    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Sources:     {}", stats.sources);
    println!("  Articles:    {}", stats.articles);
    println!(
        "  Scraped:     {} ({} failed)",
        stats.scraped, stats.scrape_failed
    );
    println!("  Summarized:  {}", stats.summarized);
    println!("  Embedded:    {}", stats.embedded);
    println!();
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        spinner.set_style(
            style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
    }
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from(["feedwatch", "run", "--days", "3", "--yes"]).unwrap();
        match cli.command {
            Command::Run {
                days, yes, decline, ..
            } => {
                assert_eq!(days, Some(3));
                assert!(yes);
                assert!(!decline);
            }
            _ => panic!("expected run"),
        }
        assert!(Cli::try_parse_from(["feedwatch", "run", "--yes", "--decline"]).is_err());
    }

    #[test]
    fn answers_default_to_decline() {
        assert_eq!(parse_answer("Y"), CostDecision::Approved);
        assert_eq!(parse_answer(" approve "), CostDecision::Approved);
        assert_eq!(parse_answer(""), CostDecision::Declined);
        assert_eq!(parse_answer("maybe"), CostDecision::Declined);
    }

    #[test]
    fn scheduled_request_follows_config() {
        let mut config = AppConfig::default();
        config.schedule.lookback_days = 7;
        config.schedule.since_last_fetch = true;
        assert_eq!(
            scheduled_request(&config),
            RefreshRequest::new(7, true).unwrap()
        );
    }
}
