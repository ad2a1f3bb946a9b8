use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Demo pipeline wiring: resource names, sizes and pacing. Every field has
/// a default so an empty config file (or none at all) runs the stock demo.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_msg_len")]
    pub max_msg_len: usize,
    #[serde(default = "default_region_name")]
    pub region_name: String,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_message_count")]
    pub message_count: usize,
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
}

fn default_queue_name() -> String {
    "/taskpipe_q".to_string()
}

fn default_queue_capacity() -> usize {
    8
}

fn default_max_msg_len() -> usize {
    64
}

fn default_region_name() -> String {
    "/taskpipe_buf".to_string()
}

fn default_buffer_capacity() -> usize {
    20
}

fn default_message_count() -> usize {
    10
}

fn default_period_ms() -> u64 {
    200
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // Deserializing the empty object applies every field default.
        serde_json::from_str("{}").expect("defaults are total")
    }
}

impl PipelineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(PipelineConfig::default());
        };
        let bytes = std::fs::read(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parse config {}", path.display()))
    }
}
