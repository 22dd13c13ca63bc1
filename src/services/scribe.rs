//! Realtime speech recognition over a WebSocket (ElevenLabs Scribe).
//!
//! A connection is split into a write loop fed by [`OutboundMessage`]s and a
//! read loop that parses tagged transcript events. Both ends are exposed to the
//! conversation as channels through [`RecognitionLink`].

use crate::config::{ConversationConfig, ServicesConfig};
use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("recognition service error: {0}")]
    Service(String),

    #[error("connection closed")]
    Closed,
}

/// Inbound messages, tagged by `message_type`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum RecognitionEvent {
    SessionStarted,
    PartialTranscript {
        #[serde(default)]
        text: String,
    },
    CommittedTranscript {
        #[serde(default)]
        text: String,
    },
    InputError {
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

pub fn parse_event(text: &str) -> Result<RecognitionEvent, RecognitionError> {
    serde_json::from_str(text).map_err(|e| RecognitionError::Protocol(e.to_string()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Little-endian 16-bit PCM
    Audio(Vec<u8>),
    Close,
}

/// JSON body for one audio chunk
pub fn audio_chunk_message(pcm_bytes: &[u8], sample_rate: u32) -> serde_json::Value {
    serde_json::json!({
        "message_type": "input_audio_chunk",
        "audio_base_64": base64::engine::general_purpose::STANDARD.encode(pcm_bytes),
        "sample_rate": sample_rate,
    })
}

/// Both directions of an open recognition stream
pub struct RecognitionLink {
    pub outbound: mpsc::Sender<OutboundMessage>,
    pub inbound: mpsc::Receiver<Result<RecognitionEvent, RecognitionError>>,
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn connect(&self) -> Result<RecognitionLink, RecognitionError>;
}

pub struct ScribeRecognizer {
    api_key: String,
    base_url: String,
    model_id: String,
    sample_rate: u32,
}

impl ScribeRecognizer {
    pub fn new(services: &ServicesConfig, conversation: &ConversationConfig) -> Self {
        Self {
            api_key: services.elevenlabs_api_key.clone(),
            base_url: services.recognition_url.clone(),
            model_id: services.recognition_model.clone(),
            sample_rate: conversation.sample_rate,
        }
    }

    pub fn stream_url(&self) -> String {
        format!(
            "{}?model_id={}&audio_format=pcm_{}&commit_strategy=vad",
            self.base_url, self.model_id, self.sample_rate
        )
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[async_trait]
impl SpeechRecognizer for ScribeRecognizer {
    async fn connect(&self) -> Result<RecognitionLink, RecognitionError> {
        if self.api_key.trim().is_empty() {
            return Err(RecognitionError::Connect(
                "ElevenLabs API key not configured".to_string(),
            ));
        }

        let url = self.stream_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RecognitionError::Connect(format!("Invalid URL: {}", e)))?;
        request.headers_mut().insert(
            "xi-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| RecognitionError::Connect(format!("Invalid API key header: {}", e)))?,
        );

        debug!("Connecting to recognition stream: {}", self.base_url);
        let (ws_stream, _response) = connect_async(request)
            .await
            .map_err(|e| RecognitionError::Connect(e.to_string()))?;
        info!("Recognition stream connected");

        let (write, read) = ws_stream.split();
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(write_loop(write, write_rx, self.sample_rate));
        tokio::spawn(forward_events(read, event_tx));

        Ok(RecognitionLink {
            outbound: write_tx,
            inbound: event_rx,
        })
    }
}

async fn write_loop(
    mut write: futures_util::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<OutboundMessage>,
    sample_rate: u32,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            OutboundMessage::Audio(pcm) => {
                let body = audio_chunk_message(&pcm, sample_rate).to_string();
                if let Err(e) = write.send(Message::Text(body)).await {
                    error!("Recognition write error: {}", e);
                    break;
                }
            }
            OutboundMessage::Close => break,
        }
    }
    let _ = write.close().await;
    debug!("Recognition write loop finished");
}

/// Forward recognition events from a socket's incoming frames.
///
/// Text frames that do not decode as a known event shape are logged and
/// skipped. Only socket read failures and a server close reach the session
/// as errors.
pub async fn forward_events<S>(
    mut read: S,
    tx: mpsc::Sender<Result<RecognitionEvent, RecognitionError>>,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(result) = read.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let event = match parse_event(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Skipping undecodable recognition frame: {}", e);
                        continue;
                    }
                };
                if tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("Recognition stream closed by server");
                let _ = tx.send(Err(RecognitionError::Closed)).await;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Recognition read error: {}", e);
                let _ = tx.send(Err(RecognitionError::Protocol(e.to_string()))).await;
                break;
            }
        }
    }
}
