//! Relay binary entry point.
//!
//! Reads prompts line-by-line from stdin and answers through the
//! orchestrator: performance-ranked selection, fallback walks, predictive
//! handoffs, and hibernation when every provider is exhausted. All
//! behavior is driven by `~/.relay/config.toml`; there are no flags.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use relay_config::RelayConfig;
use relay_context::{IntegrityStore, TiktokenEstimator};
use relay_engine::{
    BridgeResolution, BridgeStore, CompletionOutcome, Orchestrator, RecoveryOutcome,
};
use relay_monitor::{OutcomeStore, SqliteOutcomeStore};
use relay_providers::{CompletionClient, HttpCompletionClient};
use relay_types::{ConversationTurn, Role};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    // Logs go to stderr; stdout carries only completions.
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = RelayConfig::load()
        .context("failed to load configuration")?
        .unwrap_or_default();
    let registry = config.registry();
    if registry.is_empty() {
        match RelayConfig::path() {
            Some(path) => bail!(
                "no providers configured; add [[providers]] entries to {}",
                path.display()
            ),
            None => bail!("no providers configured and no home directory to look in"),
        }
    }

    let client_config = config
        .client
        .as_ref()
        .context("missing [client] section in configuration")?;
    let mut client = HttpCompletionClient::new(
        client_config.base_url.clone(),
        client_config.resolved_api_key(),
    );
    if let Some(secs) = client_config.request_timeout_secs {
        client = client.with_timeout(Duration::from_secs(secs));
    }

    let orchestrator = Orchestrator::new(
        registry,
        config.policy.clone(),
        SqliteOutcomeStore::open(config.outcomes_db_path()?)?,
        client,
        IntegrityStore::open(config.integrity_db_path()?)?,
        BridgeStore::open(config.bridge_db_path()?)?,
        Arc::new(TiktokenEstimator::new()),
    )?;

    run(orchestrator).await
}

async fn run<S: OutcomeStore, C: CompletionClient>(
    mut orchestrator: Orchestrator<S, C>,
) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let mut history: Vec<ConversationTurn> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown_rx.changed() => break,
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/stats" {
            print_stats(&mut orchestrator)?;
            continue;
        }

        history.push(ConversationTurn::new(Role::User, input));
        match orchestrator
            .complete_with_fallback(input, &history, None)
            .await?
        {
            CompletionOutcome::Completed {
                provider, content, ..
            } => {
                println!("[{provider}] {content}");
                history.push(ConversationTurn::new(Role::Assistant, content));
            }
            CompletionOutcome::Hibernated(session) => {
                tracing::warn!(%session, "all providers exhausted, waiting for recovery");
                if !recover(&mut orchestrator, &mut history, &mut shutdown_rx).await? {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Waits out a hibernation episode. Returns `false` on shutdown.
async fn recover<S: OutcomeStore, C: CompletionClient>(
    orchestrator: &mut Orchestrator<S, C>,
    history: &mut Vec<ConversationTurn>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool> {
    loop {
        match orchestrator.wait_for_recovery(shutdown).await? {
            BridgeResolution::Cancelled => return Ok(false),
            BridgeResolution::ProviderAvailable(id) => {
                tracing::info!(provider = %id, "attempting recovery");
            }
        }

        match orchestrator.attempt_recovery(history).await? {
            RecoveryOutcome::Restored {
                provider, content, ..
            } => {
                println!("[{provider}] {content}");
                history.push(ConversationTurn::new(Role::Assistant, content));
                return Ok(true);
            }
            RecoveryOutcome::Failed { provider, kind } => {
                tracing::warn!(%provider, ?kind, "recovery attempt failed, continuing to wait");
            }
            RecoveryOutcome::StillExhausted => {}
        }
    }
}

fn print_stats<S: OutcomeStore, C: CompletionClient>(
    orchestrator: &mut Orchestrator<S, C>,
) -> Result<()> {
    let stats = orchestrator.get_stats()?;

    println!("providers:");
    for ranked in &stats.rankings {
        println!(
            "  {:<40} score {:>6.1}  error rate {:>5.1}%  today {} requests{}",
            ranked.id.as_str(),
            ranked.score,
            ranked.stats.error_rate * 100.0,
            ranked.stats.requests_today,
            if ranked.stats.is_available {
                ""
            } else {
                "  [unavailable]"
            },
        );
    }
    println!(
        "handoffs: {}  bridge: {}/{} recovered  integrity: {:.1}% of {} checks passed",
        stats.handoffs.len(),
        stats.bridge.successful_recoveries,
        stats.bridge.total_activations,
        stats.integrity.success_rate(),
        stats.integrity.total_checks,
    );
    Ok(())
}
