use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Vital-sign ranges and escalation timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub pulse_min: i32,
    pub pulse_max: i32,
    pub breathing_min: i32,
    pub breathing_max: i32,
    pub confidence_threshold: f32,
    /// Seconds a reading must stay abnormal before escalation
    pub abnormal_duration_secs: f64,
    /// Minimum spacing between the start times of two alerts
    pub alert_cooldown_secs: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            pulse_min: 50,
            pulse_max: 120,
            breathing_min: 10,
            breathing_max: 25,
            confidence_threshold: 0.7,
            abnormal_duration_secs: 3.0,
            alert_cooldown_secs: 300,
        }
    }
}

impl Thresholds {
    pub fn abnormal_duration(&self) -> Duration {
        Duration::from_secs_f64(self.abnormal_duration_secs.max(0.0))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ingest_host: String,
    pub ingest_port: u16,
    pub http_host: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ingest_host: "0.0.0.0".to_string(),
            ingest_port: 5555,
            http_host: "0.0.0.0".to_string(),
            http_port: 5000,
        }
    }
}

/// Timing and audio parameters for the voice check-in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub hard_deadline_ms: u64,
    pub quiet_before_speech_ms: u64,
    pub quiet_after_speech_ms: u64,
    pub sample_rate: u32,
    pub frame_size: usize,
    pub frame_queue_capacity: usize,
    /// Consecutive deadline windows without a decision before giving up with `Timeout`
    pub max_unanswered_windows: u32,
    /// Mean absolute 16-bit amplitude at or below which a frame is not sent
    pub silence_floor: f32,
    pub send_backoff_ms: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            hard_deadline_ms: 7000,
            quiet_before_speech_ms: 300,
            quiet_after_speech_ms: 800,
            sample_rate: 16000,
            frame_size: 1600,
            frame_queue_capacity: 64,
            max_unanswered_windows: 3,
            silence_floor: 50.0,
            send_backoff_ms: 10,
        }
    }
}

impl ConversationConfig {
    pub fn hard_deadline(&self) -> Duration {
        Duration::from_millis(self.hard_deadline_ms)
    }

    pub fn quiet_before_speech(&self) -> Duration {
        Duration::from_millis(self.quiet_before_speech_ms)
    }

    pub fn quiet_after_speech(&self) -> Duration {
        Duration::from_millis(self.quiet_after_speech_ms)
    }

    pub fn send_backoff(&self) -> Duration {
        Duration::from_millis(self.send_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub highpass_cutoff_hz: f32,
    pub static_gate_threshold: f32,
    pub noise_floor_alpha: f32,
    pub initial_noise_floor: f32,
    pub target_peak: f32,
    pub max_gain: f32,
    /// Peaks at or below this pass through unscaled
    pub silence_peak: f32,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            highpass_cutoff_hz: 100.0,
            static_gate_threshold: 0.01,
            noise_floor_alpha: 0.95,
            initial_noise_floor: 0.01,
            target_peak: 0.8,
            max_gain: 3.0,
            silence_peak: 0.001,
        }
    }
}

/// Endpoints and credentials for external speech, generation and dispatch services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub elevenlabs_api_key: String,
    pub recognition_url: String,
    pub recognition_model: String,
    pub synthesis_url: String,
    pub synthesis_voice_id: String,
    pub synthesis_model: String,
    pub synthesis_output_format: String,
    pub synthesis_timeout_secs: u64,
    pub gemini_api_key: String,
    pub gemini_endpoint: String,
    pub gemini_model: String,
    pub generation_timeout_secs: u64,
    pub dispatch_url: String,
    pub dispatch_timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            elevenlabs_api_key: String::new(),
            recognition_url: "wss://api.elevenlabs.io/v1/speech-to-text/realtime".to_string(),
            recognition_model: "scribe_v2_realtime".to_string(),
            synthesis_url: "https://api.elevenlabs.io/v1/text-to-speech".to_string(),
            synthesis_voice_id: "JBFqnCBsd6RMkjVDRZzb".to_string(),
            synthesis_model: "eleven_turbo_v2_5".to_string(),
            synthesis_output_format: "mp3_44100_128".to_string(),
            synthesis_timeout_secs: 20,
            gemini_api_key: String::new(),
            gemini_endpoint: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
            gemini_model: "gemini-2.5-flash".to_string(),
            generation_timeout_secs: 8,
            dispatch_url: "http://localhost:5000".to_string(),
            dispatch_timeout_secs: 30,
        }
    }
}

/// Who gets called, and what they are told about the patient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub patient_id: String,
    pub patient_name: String,
    pub address: String,
    pub emergency_number: String,
    pub contact_number: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            patient_id: "unknown".to_string(),
            patient_name: "Emergency Alert".to_string(),
            address: "Patient's home".to_string(),
            emergency_number: String::new(),
            contact_number: String::new(),
        }
    }
}

/// Internal configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    pub thresholds: Thresholds,
    pub network: NetworkConfig,
    pub conversation: ConversationConfig,
    pub preprocessing: PreprocessingConfig,
    pub services: ServicesConfig,
    pub dispatch: DispatchConfig,
    pub input_device_id: Option<String>,
    /// Directory for per-action ledgers; defaults under the config dir
    pub actions_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: 1,
            thresholds: Thresholds::default(),
            network: NetworkConfig::default(),
            conversation: ConversationConfig::default(),
            preprocessing: PreprocessingConfig::default(),
            services: ServicesConfig::default(),
            dispatch: DispatchConfig::default(),
            input_device_id: None,
            actions_dir: None,
        }
    }
}

impl Config {
    /// Get the default config directory
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".pulseguard"))
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    pub fn log_dir() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("logs"))
    }

    /// Load config from the given file (or the default location), falling back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let loaded = match path {
            Some(p) => Self::load_from(p),
            None => Self::config_path().and_then(|p| Self::load_from(&p)),
        };
        let mut config = match loaded {
            Ok(config) => config,
            Err(e) => {
                debug!("Failed to load config, using default: {:#}", e);
                Self::default()
            }
        };
        config.apply_env_overrides();
        config
    }

    /// Load config from file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&content).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// API keys from the environment take precedence over the file
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("ELEVENLABS_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.services.elevenlabs_api_key = key;
        }
        if let Some(key) = lookup("GEMINI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.services.gemini_api_key = key;
        }
    }

    pub fn actions_dir(&self) -> Result<PathBuf> {
        match &self.actions_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::config_dir()?.join("actions")),
        }
    }
}
