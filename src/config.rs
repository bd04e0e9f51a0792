//! Process configuration
//!
//! Every tunable lives in [`Config`]. `Default` gives the production values
//! minus credentials; [`Config::from_env`] layers API keys and overrides on top.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful voice assistant. Answer briefly and to the point, without lead-ins.
Your reply is read aloud: write plain prose, never markdown. Put each sentence on its own line.
The user's words were transcribed from speech and may contain homophone mistakes; make your best guess at what was meant rather than asking for clarification.";

/// Speech-to-text upstream settings
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub url: String,
    pub api_key: String,
    /// Interval between keepalive frames while the connection is ready
    pub keepalive_interval: Duration,
    /// Consecutive blank transcripts (after speech) that end an utterance
    pub blank_events_to_end: usize,
    /// Number of pre-warmed connections
    pub pool_size: usize,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.deepgram.com/v1/listen?model=nova-2-conversationalai&endpointing=400"
                .to_string(),
            api_key: String::new(),
            keepalive_interval: Duration::from_secs(2),
            blank_events_to_end: 1,
            pool_size: 2,
        }
    }
}

/// Language model settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Speech synthesis settings
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub url: String,
    pub api_key: String,
    pub api_version: String,
    pub model_id: String,
    pub voice_id: String,
    pub sample_rate: u32,
    /// Size of re-chunked audio frames in bytes, a multiple of the f32 sample width
    pub frame_size: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.cartesia.ai/tts/websocket".to_string(),
            api_key: String::new(),
            api_version: "2024-06-10".to_string(),
            model_id: "sonic-english".to_string(),
            voice_id: "11af83e2-23eb-452f-956e-7fee218ccb5c".to_string(),
            sample_rate: 16_000,
            frame_size: 48 * 1024,
        }
    }
}

impl TtsConfig {
    /// Content type served for synthesized audio
    pub fn content_type(&self) -> String {
        format!("audio/pcm;encoding=float;bits=32;rate={}", self.sample_rate)
    }
}

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    /// Upper bound on opening any upstream connection or request
    pub connect_timeout: Duration,
    /// Unclaimed playback streams are evicted after this long
    pub playback_idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            stt: SttConfig::default(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            connect_timeout: Duration::from_secs(10),
            playback_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Build the configuration from environment variables.
    ///
    /// `DEEPGRAM_KEY`, `OPENAI_KEY` and `CARTESIA_KEY` are required.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Config(format!("{key} is not set")))
        };

        let mut config = Config::default();
        config.stt.api_key = required("DEEPGRAM_KEY")?;
        config.llm.api_key = required("OPENAI_KEY")?;
        config.tts.api_key = required("CARTESIA_KEY")?;

        if let Some(voice) = lookup("CARTESIA_VOICE_ID") {
            config.tts.voice_id = voice;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            config.llm.model = model;
        }
        if let Some(prompt) = lookup("SYSTEM_PROMPT") {
            config.llm.system_prompt = prompt;
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::Config(format!("PORT is not a valid port: {port}")))?;
            config.bind_addr.set_port(port);
        }
        if let Some(size) = lookup("STT_POOL_SIZE") {
            config.stt.pool_size = size
                .parse()
                .map_err(|_| Error::Config(format!("STT_POOL_SIZE is not a number: {size}")))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.stt.pool_size, 2);
        assert_eq!(config.stt.keepalive_interval, Duration::from_secs(2));
        assert_eq!(config.tts.frame_size, 48 * 1024);
        assert_eq!(config.tts.frame_size % 4, 0);
        assert_eq!(config.bind_addr.port(), 8000);
    }

    #[test]
    fn test_from_env_requires_keys() {
        let err = Config::from_lookup(env(&[("DEEPGRAM_KEY", "dg")])).unwrap_err();
        assert!(err.to_string().contains("OPENAI_KEY"));
    }

    #[test]
    fn test_from_env_overrides() {
        let config = Config::from_lookup(env(&[
            ("DEEPGRAM_KEY", "dg"),
            ("OPENAI_KEY", "oa"),
            ("CARTESIA_KEY", "ca"),
            ("PORT", "9100"),
            ("STT_POOL_SIZE", "4"),
            ("LLM_MODEL", "gpt-4o-mini"),
        ]))
        .unwrap();

        assert_eq!(config.stt.api_key, "dg");
        assert_eq!(config.bind_addr.port(), 9100);
        assert_eq!(config.stt.pool_size, 4);
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn test_invalid_port() {
        let result = Config::from_lookup(env(&[
            ("DEEPGRAM_KEY", "dg"),
            ("OPENAI_KEY", "oa"),
            ("CARTESIA_KEY", "ca"),
            ("PORT", "eighty"),
        ]));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
