use std::process::ExitCode;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use raven_pipeline::api::{self, ApiState, BackendProbe};
use raven_pipeline::bot::{
    exit_code, launch_meeting_browser, AudioGateHandler, BotService, CdpBridge, ManagerClient,
    SessionBinding,
};
use raven_pipeline::broker::{Broker, RedisBroker, StageHandler, StageWorker};
use raven_pipeline::config::{self, BotConfig, BrokerConfig, ResponderConfig, SynthConfig, WakeConfig};
use raven_pipeline::responder::{OllamaClient, ResponderService};
use raven_pipeline::synth::{SynthService, TtsGateway};
use raven_pipeline::wake::{patterns, WakeDetector, WakeService};
use raven_pipeline::{Language, StageStats};

/// Raven - in-meeting voice assistant pipeline
#[derive(Parser)]
#[command(name = "raven", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the wake word detector (transcripts → hey_raven_commands)
    WakeDetector,
    /// Run the LLM responder (hey_raven_commands → llm_responses)
    Responder,
    /// Run the speech synthesizer (llm_responses → tts_audio_queue)
    Synthesizer,
    /// Run the meeting bot player (tts_audio_queue → meeting audio)
    Bot,
    /// Run the wake detector over one line of text
    TestWake {
        /// Transcript text to test
        text: String,
    },
    /// Synthesize one utterance and print its metadata
    TestTts {
        /// Text to synthesize
        #[arg(default_value = "Hello! This is a test of the Raven speech pipeline.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,raven_pipeline=info",
        1 => "info,raven_pipeline=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::WakeDetector => run_wake_detector().await,
        Command::Responder => run_responder().await,
        Command::Synthesizer => run_synthesizer().await,
        Command::Bot => run_bot().await,
        Command::TestWake { text } => test_wake(&text),
        Command::TestTts { text } => test_tts(&text).await,
    }
}

/// Flip the shutdown flag on SIGINT or SIGTERM, remembering which
/// signal fired for the exit report.
fn spawn_signal_watcher(tx: watch::Sender<bool>) -> Arc<AtomicI32> {
    let code = Arc::new(AtomicI32::new(exit_code::NORMAL));
    let seen = Arc::clone(&code);

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    seen.store(exit_code::INTERRUPTED, Ordering::SeqCst);
                    tracing::info!("SIGINT received, shutting down");
                }
                _ = term.recv() => {
                    seen.store(exit_code::TERMINATED, Ordering::SeqCst);
                    tracing::info!("SIGTERM received, shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            seen.store(exit_code::INTERRUPTED, Ordering::SeqCst);
            tracing::info!("interrupt received, shutting down");
        }

        let _ = tx.send(true);
    });

    code
}

async fn run_wake_detector() -> anyhow::Result<ExitCode> {
    let broker_config = BrokerConfig::from_env()?;
    let config = WakeConfig::from_env()?;
    tracing::info!(
        input = %config.input_stream,
        output = %config.output_stream,
        group = %config.group,
        patterns = ?config.patterns_path,
        "starting wake detector"
    );

    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&broker_config.url).await?);
    let stats = Arc::new(StageStats::new());

    let shared = patterns::shared(config.patterns_path.as_deref());
    if let Some(path) = &config.patterns_path {
        patterns::spawn_reload_on_sighup(Arc::clone(&shared), path.clone());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_watcher(shutdown_tx);

    let worker = StageWorker::new(
        Arc::clone(&broker),
        config.input_stream.clone(),
        config.group.clone(),
        config::consumer_name("wake-detector"),
        broker_config,
        Arc::clone(&stats),
        shutdown_rx.clone(),
    );
    worker.bootstrap().await?;

    let handler: Arc<dyn StageHandler> = Arc::new(WakeService::new(
        Arc::clone(&broker),
        WakeDetector::new(shared),
        config.output_stream.clone(),
        Arc::clone(&stats),
    ));

    let api_state = Arc::new(ApiState {
        stage: "wake-detector",
        broker: Arc::clone(&broker),
        backend: None,
        stats: Arc::clone(&stats),
        streams: vec![config.input_stream.clone(), config.output_stream.clone()],
    });

    run_stage(worker, handler, api_state, config.http_port, shutdown_rx).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_responder() -> anyhow::Result<ExitCode> {
    let broker_config = BrokerConfig::from_env()?;
    let config = ResponderConfig::from_env()?;
    tracing::info!(
        input = %config.input_stream,
        output = %config.output_stream,
        group = %config.group,
        model = %config.model,
        "starting responder"
    );

    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&broker_config.url).await?);
    let stats = Arc::new(StageStats::new());

    let llm = Arc::new(OllamaClient::new(&config)?);
    // Model bootstrap is a readiness gate; an orchestrator restarts us
    llm.initialize().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_watcher(shutdown_tx);

    let worker = StageWorker::new(
        Arc::clone(&broker),
        config.input_stream.clone(),
        config.group.clone(),
        config::consumer_name("llm-processor"),
        broker_config,
        Arc::clone(&stats),
        shutdown_rx.clone(),
    );
    worker.bootstrap().await?;

    let api_state = Arc::new(ApiState {
        stage: "responder",
        broker: Arc::clone(&broker),
        backend: Some(Arc::clone(&llm) as Arc<dyn BackendProbe>),
        stats: Arc::clone(&stats),
        streams: vec![config.input_stream.clone(), config.output_stream.clone()],
    });

    let handler: Arc<dyn StageHandler> = Arc::new(ResponderService::new(
        Arc::clone(&broker),
        llm,
        config.clone(),
        config::worker_pool_size(),
        Arc::clone(&stats),
    ));

    run_stage(worker, handler, api_state, config.http_port, shutdown_rx).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_synthesizer() -> anyhow::Result<ExitCode> {
    let broker_config = BrokerConfig::from_env()?;
    let config = SynthConfig::from_env()?;
    tracing::info!(
        input = %config.input_stream,
        output = %config.output_stream,
        group = %config.group,
        preferred_engine = %config.preferred_engine,
        "starting synthesizer"
    );

    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&broker_config.url).await?);
    let stats = Arc::new(StageStats::new());
    let tts = Arc::new(TtsGateway::from_config(&config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_watcher(shutdown_tx);

    let worker = StageWorker::new(
        Arc::clone(&broker),
        config.input_stream.clone(),
        config.group.clone(),
        config::consumer_name("tts-processor"),
        broker_config,
        Arc::clone(&stats),
        shutdown_rx.clone(),
    );
    worker.bootstrap().await?;

    let api_state = Arc::new(ApiState {
        stage: "synthesizer",
        broker: Arc::clone(&broker),
        backend: Some(Arc::clone(&tts) as Arc<dyn BackendProbe>),
        stats: Arc::clone(&stats),
        streams: vec![config.input_stream.clone(), config.output_stream.clone()],
    });

    let handler: Arc<dyn StageHandler> = Arc::new(SynthService::new(
        Arc::clone(&broker),
        tts,
        config.clone(),
        config::worker_pool_size(),
        Arc::clone(&stats),
    ));

    run_stage(worker, handler, api_state, config.http_port, shutdown_rx).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_bot() -> anyhow::Result<ExitCode> {
    let broker_config = BrokerConfig::from_env()?;
    let config = BotConfig::from_env()?;
    tracing::info!(
        connection_id = %config.connection_id,
        meeting_id = %config.meeting_id,
        stream = %config.audio_stream,
        "starting meeting bot"
    );

    let manager = ManagerClient::new(config.manager_url.clone(), config.connection_id.clone())?;

    let Some(meeting_url) = config.meeting_url.clone() else {
        manager
            .notify_exit(exit_code::ADMISSION_FAILED, "no meeting URL", None)
            .await;
        anyhow::bail!("RAVEN_MEETING_URL is required for the bot stage");
    };

    let (browser, page) = match launch_meeting_browser(&meeting_url).await {
        Ok(pair) => pair,
        Err(e) => {
            manager
                .notify_exit(
                    exit_code::ADMISSION_FAILED,
                    "meeting join failed",
                    Some(&e.to_string()),
                )
                .await;
            return Err(e.into());
        }
    };

    let (bridge, events_rx) = CdpBridge::attach(page).await?;

    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&broker_config.url).await?);
    let stats = Arc::new(StageStats::new());
    let binding = Arc::new(SessionBinding::new(
        config.connection_id.clone(),
        config.meeting_id.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_code = spawn_signal_watcher(shutdown_tx);

    let (player, audio_tx) = BotService::new(
        Arc::clone(&binding),
        Arc::new(bridge),
        events_rx,
        &config,
        shutdown_rx.clone(),
    );

    let handler: Arc<dyn StageHandler> = Arc::new(AudioGateHandler::new(
        Arc::clone(&binding),
        audio_tx,
        Arc::clone(&stats),
    ));

    // Every bot gets its own group so each observes every audio record
    let group = format!("audio_player_{}", config.connection_id);
    let worker = Arc::new(StageWorker::new(
        Arc::clone(&broker),
        config.audio_stream.clone(),
        group,
        config.connection_id.clone(),
        broker_config,
        Arc::clone(&stats),
        shutdown_rx.clone(),
    ));
    worker.bootstrap().await?;

    let api_state = Arc::new(ApiState {
        stage: "bot",
        broker: Arc::clone(&broker),
        backend: None,
        stats: Arc::clone(&stats),
        streams: vec![config.audio_stream.clone()],
    });

    let api_task = tokio::spawn(api::serve(api_state, config.http_port, shutdown_rx.clone()));
    let claim_worker = Arc::clone(&worker);
    let claim_handler = Arc::clone(&handler);
    let claim_task = tokio::spawn(async move { claim_worker.run_claimer(claim_handler).await });
    let consume_worker = Arc::clone(&worker);
    let consume_task = tokio::spawn(async move { consume_worker.run(handler).await });

    // The player owns the drain; run it on this task
    player.run().await;

    let _ = consume_task.await;
    claim_task.abort();
    api_task.abort();
    drop(browser);

    let code = signal_code.load(Ordering::SeqCst);
    let reason = match code {
        exit_code::INTERRUPTED | exit_code::TERMINATED => "signal shutdown",
        _ => "player stopped",
    };
    manager.notify_exit(code, reason, None).await;

    // Propagate the signal-derived code so the orchestrator sees it
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

/// Common tail for the three broker-driven stages: consumer loop,
/// stale-claimer, and HTTP API, all stopping on the shutdown signal.
async fn run_stage(
    worker: StageWorker,
    handler: Arc<dyn StageHandler>,
    api_state: Arc<ApiState>,
    http_port: u16,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let worker = Arc::new(worker);

    let api_task = tokio::spawn(api::serve(api_state, http_port, shutdown));
    let claim_worker = Arc::clone(&worker);
    let claim_handler = Arc::clone(&handler);
    let claim_task = tokio::spawn(async move { claim_worker.run_claimer(claim_handler).await });

    worker.run(handler).await?;

    claim_task.abort();
    api_task.abort();
    Ok(())
}

fn test_wake(text: &str) -> anyhow::Result<ExitCode> {
    let config = WakeConfig::from_env()?;
    let detector = WakeDetector::new(patterns::shared(config.patterns_path.as_deref()));

    match detector.detect(text) {
        Some(detection) => {
            println!("detected: kind={} confidence={}", detection.kind, detection.confidence);
            println!("question: {}", detection.question);
        }
        None => println!("no wake phrase detected"),
    }

    Ok(ExitCode::SUCCESS)
}

async fn test_tts(text: &str) -> anyhow::Result<ExitCode> {
    let config = SynthConfig::from_env()?;
    let gateway = TtsGateway::from_config(&config)?;

    println!("Synthesizing: \"{text}\"");
    let output = gateway
        .synthesize(text, Language::from_code(&config.default_language))
        .await?;

    println!(
        "engine={} format={} bytes={}",
        output.engine,
        output.format.as_str(),
        output.audio.len()
    );

    Ok(ExitCode::SUCCESS)
}
