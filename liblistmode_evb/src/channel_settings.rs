use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use super::error::SettingsError;

/// Detector species attached to a channel, used to pick the rebinning factor
/// during peak extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorType {
    Unknown,
    AntiCoincidence,
    Photomultiplier,
    HighPurityGermanium,
    Silicon,
}

impl DetectorType {
    /// Parse the keyword used in the channel settings file. Unrecognized or
    /// empty keywords map to `Unknown`.
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword.to_ascii_lowercase().as_str() {
            "ac" => Self::AntiCoincidence,
            "pmt" => Self::Photomultiplier,
            "hpge" => Self::HighPurityGermanium,
            "si" | "silicon" => Self::Silicon,
            _ => Self::Unknown,
        }
    }

    /// Rebinning factor applied to time-difference projections before peak
    /// location.
    pub fn rebin_factor(&self) -> usize {
        match self {
            Self::AntiCoincidence => 10,
            Self::HighPurityGermanium => 100,
            _ => 1,
        }
    }
}

/// Per-channel configuration record.
///
/// The calibration polynomial and the geometric fields are carried for the
/// downstream analysis and are not consumed by the builder itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSetting {
    #[serde(rename = "IsEventTrigger")]
    pub is_event_trigger: bool,
    #[serde(rename = "ID")]
    pub id: i32,
    #[serde(rename = "Module")]
    pub module: u32,
    #[serde(rename = "Channel")]
    pub channel: u32,
    #[serde(rename = "ThresholdADC")]
    pub threshold_adc: u16,
    #[serde(rename = "HasAC")]
    pub has_ac: bool,
    #[serde(rename = "ACModule")]
    pub ac_module: u32,
    #[serde(rename = "ACChannel")]
    pub ac_channel: u32,
    #[serde(rename = "Phi")]
    pub phi: f64,
    #[serde(rename = "Theta")]
    pub theta: f64,
    #[serde(rename = "Distance")]
    pub distance: f64,
    #[serde(rename = "x")]
    pub x: f64,
    #[serde(rename = "y")]
    pub y: f64,
    #[serde(rename = "z")]
    pub z: f64,
    #[serde(rename = "p0")]
    pub p0: f64,
    #[serde(rename = "p1")]
    pub p1: f64,
    #[serde(rename = "p2")]
    pub p2: f64,
    #[serde(rename = "p3")]
    pub p3: f64,
    #[serde(rename = "DetectorType")]
    pub detector_type: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
}

impl ChannelSetting {
    fn template(module: u32, channel: u32, id: i32) -> Self {
        Self {
            is_event_trigger: false,
            id,
            module,
            channel,
            threshold_adc: 0,
            has_ac: false,
            ac_module: 128,
            ac_channel: 128,
            phi: 0.0,
            theta: 0.0,
            distance: 0.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            p0: 0.0,
            p1: 1.0,
            p2: 0.0,
            p3: 0.0,
            detector_type: String::new(),
            tags: Vec::new(),
        }
    }

    pub fn detector_type(&self) -> DetectorType {
        DetectorType::from_keyword(&self.detector_type)
    }

    /// True if any of `tags` appears in this channel's tag list.
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        self.tags.iter().any(|t| tags.contains(t))
    }
}

/// The full channel configuration, indexed `[module][channel]`.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    channels: Vec<Vec<ChannelSetting>>,
}

impl ChannelConfig {
    /// Load the channel settings JSON (an array of per-module arrays of
    /// channel records).
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Err(SettingsError::BadFilePath(path.to_path_buf()));
        }
        let reader = BufReader::new(File::open(path)?);
        let channels: Vec<Vec<ChannelSetting>> = serde_json::from_reader(reader)?;
        if channels.is_empty() {
            return Err(SettingsError::Empty(path.to_path_buf()));
        }
        Ok(Self { channels })
    }

    pub fn from_channels(channels: Vec<Vec<ChannelSetting>>) -> Self {
        Self { channels }
    }

    /// Write a template configuration with one record per channel, ids
    /// numbered row-major from zero.
    pub fn write_template(path: &Path, channels_per_module: &[u32]) -> Result<(), SettingsError> {
        let mut id = 0;
        let channels: Vec<Vec<ChannelSetting>> = channels_per_module
            .iter()
            .enumerate()
            .map(|(module, &n_channels)| {
                (0..n_channels)
                    .map(|channel| {
                        let setting = ChannelSetting::template(module as u32, channel, id);
                        id += 1;
                        setting
                    })
                    .collect()
            })
            .collect();
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &channels)?;
        Ok(())
    }

    /// Look up the setting for a hardware address. Returns `None` for
    /// channels outside the configured range.
    pub fn get(&self, module: u8, channel: u8) -> Option<&ChannelSetting> {
        self.channels
            .get(module as usize)
            .and_then(|m| m.get(channel as usize))
    }

    pub fn n_modules(&self) -> usize {
        self.channels.len()
    }

    pub fn n_channels(&self, module: usize) -> usize {
        self.channels.get(module).map_or(0, |m| m.len())
    }

    /// Largest channel id in the configuration.
    pub fn max_id(&self) -> i32 {
        self.iter().map(|s| s.id).max().unwrap_or(0)
    }

    /// Iterate over every channel record in module-major order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelSetting> {
        self.channels.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detector_keywords() {
        assert_eq!(DetectorType::from_keyword("AC"), DetectorType::AntiCoincidence);
        assert_eq!(DetectorType::from_keyword("pmt"), DetectorType::Photomultiplier);
        assert_eq!(
            DetectorType::from_keyword("HPGe"),
            DetectorType::HighPurityGermanium
        );
        assert_eq!(DetectorType::from_keyword("Si"), DetectorType::Silicon);
        assert_eq!(DetectorType::from_keyword(""), DetectorType::Unknown);
        assert_eq!(DetectorType::from_keyword("bgo"), DetectorType::Unknown);
    }

    #[test]
    fn rebin_factors() {
        assert_eq!(DetectorType::AntiCoincidence.rebin_factor(), 10);
        assert_eq!(DetectorType::HighPurityGermanium.rebin_factor(), 100);
        assert_eq!(DetectorType::Photomultiplier.rebin_factor(), 1);
    }

    #[test]
    fn template_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chSettings.json");
        ChannelConfig::write_template(&path, &[2, 3]).unwrap();

        let config = ChannelConfig::load(&path).unwrap();
        assert_eq!(config.n_modules(), 2);
        assert_eq!(config.n_channels(0), 2);
        assert_eq!(config.n_channels(1), 3);
        assert_eq!(config.max_id(), 4);

        let setting = config.get(1, 2).unwrap();
        assert_eq!(setting.module, 1);
        assert_eq!(setting.channel, 2);
        assert_eq!(setting.id, 4);
        assert_eq!(setting.p1, 1.0);
        assert!(config.get(2, 0).is_none());
        assert!(config.get(0, 2).is_none());
    }
}
