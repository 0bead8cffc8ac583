use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Run defaults kept in a TOML file. Unset keys fall through to the
/// built-in defaults; range clamps apply as for flags.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Preset {
    pub playback_device: Option<String>,
    pub capture_device: Option<String>,
    pub sample_rate: Option<i64>,
    pub period: Option<i64>,
    pub playback_periods: Option<i64>,
    pub capture_periods: Option<i64>,
    pub playback_channels: Option<i64>,
    pub capture_channels: Option<i64>,
    pub run_for: Option<f32>,
    pub priority: Option<i32>,
    pub sync: Option<bool>,
    pub debug: Option<bool>,
    pub recovery_attempts: Option<u32>,
}

pub fn parse(text: &str) -> Result<Preset> {
    toml::from_str(text).context("invalid preset")
}

pub fn load(path: &Path) -> Result<Preset> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read preset {}", path.display()))?;
    parse(&text).with_context(|| format!("in {}", path.display()))
}
