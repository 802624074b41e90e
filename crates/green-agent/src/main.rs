use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use green_agent::channel::JsonRpcChannel;
use green_agent::evaluator::Evaluator;
use green_agent::generation::HttpSynthesizer;
use green_agent::generator::AdaptiveGenerator;
use green_agent::orchestrator::AdaptiveLoop;
use green_agent::platform::{ArtifactSink, HttpPlatform, LogReporter, StatusReporter};
use green_agent::weakness::{SeverityWeighted, WeaknessAnalyzer, WeaknessStore};
use green_agent::ScenarioConfig;

#[derive(Parser)]
#[command(name = "green-agent", about = "Adaptive evaluation harness")]
struct Cli {
    /// Path to scenario.toml. Defaults apply when omitted.
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// JSON-RPC endpoint of the subject (purple) agent.
    #[arg(long)]
    purple_url: String,

    /// Base URL of the case generation service.
    #[arg(long)]
    generator_url: String,

    /// Platform base URL for status/artifact reporting. Logs locally when
    /// omitted.
    #[arg(long)]
    platform_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.scenario {
        Some(path) => ScenarioConfig::from_file(path)?,
        None => {
            let config = ScenarioConfig::default();
            config.validate()?;
            config
        }
    };
    info!(
        initial_round_size = config.initial_round_size,
        top_k = config.top_k,
        max_rounds = config.max_rounds,
        "Green agent starting"
    );

    let synthesizer = Arc::new(HttpSynthesizer::new(
        cli.generator_url.clone(),
        Duration::from_secs(60),
    )?);
    let generator = AdaptiveGenerator::new(synthesizer, config.synthesis_retries);

    let analyzer = Arc::new(WeaknessAnalyzer::new(
        WeaknessStore::new(),
        Box::new(SeverityWeighted),
    ));
    let evaluator = Arc::new(Evaluator::new(
        Arc::clone(&analyzer),
        config.max_turns_per_case,
    ));

    let channel = Arc::new(JsonRpcChannel::new(
        cli.purple_url.clone(),
        Duration::from_millis(500),
    )?);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Cancellation requested");
            signal_cancel.cancel();
        }
    });

    let (reporter, sink): (Arc<dyn StatusReporter>, Arc<dyn ArtifactSink>) =
        match &cli.platform_url {
            Some(url) => {
                let platform = Arc::new(HttpPlatform::new(url.clone())?);
                let reporter: Arc<dyn StatusReporter> = platform.clone();
                (reporter, platform)
            }
            None => {
                let local = Arc::new(LogReporter);
                let reporter: Arc<dyn StatusReporter> = local.clone();
                (reporter, local)
            }
        };

    let outcome = AdaptiveLoop::new(
        config, generator, evaluator, analyzer, channel, reporter, sink, cancel,
    )
    .run()
    .await?;

    println!("{}", outcome.report.summary());
    if let Some(err) = outcome.submission_error {
        return Err(err).context("run finished but artifact submission failed");
    }
    Ok(())
}
