//! Backend configuration.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Source language passed to every backend.
    pub language: String,
    pub polling: PollingOptions,
    pub streaming: StreamingOptions,
    pub recognize: RecognizeOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            language: "zh-TW".into(),
            polling: PollingOptions::default(),
            streaming: StreamingOptions::default(),
            recognize: RecognizeOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PollingOptions {
    /// Object storage endpoint holding uploads and job results.
    pub store_url: String,
    /// Transcription job service endpoint.
    pub jobs_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamingOptions {
    /// WebSocket endpoint of the streaming recognizer.
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognizeOptions {
    /// WebSocket endpoint of the utterance recognizer.
    pub url: String,
    pub api_key: Option<String>,
    /// Split each utterance by distributing its duration across sentences.
    /// Smaller cues, slightly approximate times.
    pub split: bool,
}

impl Default for RecognizeOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            split: true,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    }
}
