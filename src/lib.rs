//! Vital-sign anomaly escalation with a turn-taking voice check-in.
//!
//! Measurement samples arrive over a line-delimited socket and are evaluated
//! by the abnormality detector. A sustained abnormal episode starts an alert,
//! which runs one voice conversation and resolves to an action.

pub mod actions;
pub mod activity_log;
pub mod alert;
pub mod audio;
pub mod config;
pub mod conversation;
pub mod detector;
pub mod ingest;
pub mod server;
pub mod services;
pub mod vitals;


pub use config::Config;

use actions::{ActionLedger, ActionResolver};
use alert::AlertManager;
use anyhow::{Context, Result};
use audio::{MicrophoneInput, RodioPlayer};
use conversation::{VoiceAgent, VoiceDeps};
use detector::AbnormalityDetector;
use ingest::IngestServer;
use services::{
    ElevenLabsSynthesizer, GeminiClient, HttpDispatcher, ScribeRecognizer, SpeechSynthesizer,
    SuggestionGenerator, UnconfiguredGenerator, UnconfiguredSynthesizer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vitals::{LatestVitals, MeasurementSample};

/// Escalations queued between the detector and the alert manager
const ESCALATION_QUEUE: usize = 8;

/// Build the production collaborators for a voice session
pub fn build_voice_deps(config: &Config) -> Result<VoiceDeps> {
    let synthesizer: Arc<dyn SpeechSynthesizer> = match ElevenLabsSynthesizer::new(&config.services) {
        Ok(tts) => Arc::new(tts),
        Err(e) => {
            warn!("Speech synthesis disabled: {}", e);
            Arc::new(UnconfiguredSynthesizer)
        }
    };
    let generator: Arc<dyn SuggestionGenerator> = match GeminiClient::new(&config.services) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!("Calming suggestions will use the fallback text: {}", e);
            Arc::new(UnconfiguredGenerator)
        }
    };
    let dispatcher = HttpDispatcher::new(&config.services).map_err(anyhow::Error::msg)?;
    let resolver = ActionResolver::new(
        Arc::new(dispatcher),
        config.dispatch.clone(),
        ActionLedger::new(config.actions_dir()?),
    );

    Ok(VoiceDeps {
        recognizer: Arc::new(ScribeRecognizer::new(&config.services, &config.conversation)),
        synthesizer,
        player: Arc::new(RodioPlayer::new()),
        generator,
        input: Arc::new(MicrophoneInput::new(
            config.input_device_id.clone(),
            config.conversation.sample_rate,
        )),
        resolver: Arc::new(resolver),
    })
}

/// Forward detector escalations to the alert manager
pub async fn consume_escalations(
    mut escalations: mpsc::Receiver<MeasurementSample>,
    alerts: Arc<AlertManager>,
) {
    while let Some(sample) = escalations.recv().await {
        if !alerts.try_trigger(sample) {
            info!("Escalation dropped: alert active or cooling down");
        }
    }
}

/// Run ingestion, escalation and the HTTP surface until Ctrl-C
pub async fn run(config: Config) -> Result<()> {
    let deps = build_voice_deps(&config)?;
    let resolver = deps.resolver.clone();
    let agent = VoiceAgent::new(config.conversation.clone(), config.preprocessing.clone(), deps);

    let alerts = Arc::new(AlertManager::new(
        config.thresholds.cooldown(),
        config.dispatch.patient_id.clone(),
        Arc::new(agent),
        resolver,
    ));

    let (escalation_tx, escalation_rx) = mpsc::channel(ESCALATION_QUEUE);
    let detector = Arc::new(AbnormalityDetector::new(config.thresholds.clone(), escalation_tx));
    let latest = Arc::new(LatestVitals::new());
    let shutdown = CancellationToken::new();

    tokio::spawn(consume_escalations(escalation_rx, alerts.clone()));

    let ingest_addr: SocketAddr = format!("{}:{}", config.network.ingest_host, config.network.ingest_port)
        .parse()
        .context("Invalid ingestion address")?;
    let listener = IngestServer::bind(ingest_addr).await?;
    let ingest = IngestServer::new(latest.clone(), detector.clone());
    let ingest_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { ingest.run(listener, shutdown).await })
    };

    let http_addr: SocketAddr = format!("{}:{}", config.network.http_host, config.network.http_port)
        .parse()
        .context("Invalid HTTP address")?;
    let state = server::AppState {
        latest,
        detector,
        alerts: alerts.clone(),
    };
    let http_task = tokio::spawn(server::serve(http_addr, state, shutdown.clone()));

    info!("pulse-guard running");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    alerts.stop_active();
    shutdown.cancel();
    if ingest_task.await.is_err() {
        error!("Ingestion task panicked");
    }
    match http_task.await {
        Ok(Err(e)) => error!("{:#}", e),
        Err(_) => error!("HTTP task panicked"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
