//! Engine configuration
//!
//! A small YAML-backed store for the keys the mixer consumes. Loading is
//! forgiving: a missing or unparsable file yields defaults with a warning.
//! Values that make no sense for the realtime path are normalized on use
//! and written back, so the stored file converges to something valid.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{DEFAULT_FRAMES_PER_PERIOD, MIN_FRAMES_PER_PERIOD};

/// Lowest sample rate the engine will process at
pub const MIN_SAMPLE_RATE: u32 = 44100;

/// The `mixer` section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerSection {
    /// Period length in frames; below the minimum the default is restored
    pub framesperaudiobuffer: u32,
    /// Base sample rate; clamped up to `MIN_SAMPLE_RATE`
    pub samplerate: u32,
    /// Preferred audio backend name; empty means "try all"
    pub audiodev: String,
    /// Preferred MIDI backend name; empty means "try all"
    pub mididev: String,
}

impl Default for MixerSection {
    fn default() -> Self {
        Self {
            framesperaudiobuffer: DEFAULT_FRAMES_PER_PERIOD as u32,
            samplerate: MIN_SAMPLE_RATE,
            audiodev: String::new(),
            mididev: String::new(),
        }
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mixer: MixerSection,
}

impl Config {
    /// Period length after validation: a power of two, at least
    /// `MIN_FRAMES_PER_PERIOD`. Out-of-range values fall back to the
    /// default rather than to the nearest bound.
    pub fn frames_per_period(&self) -> usize {
        let configured = self.mixer.framesperaudiobuffer as usize;
        if configured < MIN_FRAMES_PER_PERIOD {
            return DEFAULT_FRAMES_PER_PERIOD;
        }
        configured.next_power_of_two()
    }

    /// Base sample rate, clamped to the minimum the engine supports.
    pub fn base_sample_rate(&self) -> u32 {
        self.mixer.samplerate.max(MIN_SAMPLE_RATE)
    }

    /// Rewrite out-of-range values in place. Returns true when anything
    /// changed, so the caller knows to persist the corrected file.
    pub fn normalize(&mut self) -> bool {
        let mut changed = false;
        if (self.mixer.framesperaudiobuffer as usize) < MIN_FRAMES_PER_PERIOD {
            self.mixer.framesperaudiobuffer = DEFAULT_FRAMES_PER_PERIOD as u32;
            changed = true;
        } else if !self.mixer.framesperaudiobuffer.is_power_of_two() {
            self.mixer.framesperaudiobuffer =
                self.mixer.framesperaudiobuffer.next_power_of_two();
            changed = true;
        }
        if self.mixer.samplerate < MIN_SAMPLE_RATE {
            self.mixer.samplerate = MIN_SAMPLE_RATE;
            changed = true;
        }
        changed
    }
}

/// Load configuration from a YAML file.
///
/// A missing file yields defaults; an invalid file logs a warning and
/// yields defaults.
pub fn load_config(path: &Path) -> Config {
    if !path.exists() {
        log::info!("config: {:?} does not exist, using defaults", path);
        return Config::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<Config>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("config: failed to parse {:?}: {}, using defaults", path, e);
                Config::default()
            }
        },
        Err(e) => {
            log::warn!("config: failed to read {:?}: {}, using defaults", path, e);
            Config::default()
        }
    }
}

/// Save configuration to a YAML file, creating parent directories.
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {:?}", parent))?;
    }
    let yaml = serde_yaml::to_string(config).context("serializing config")?;
    std::fs::write(path, yaml).with_context(|| format!("writing config to {:?}", path))?;
    Ok(())
}
