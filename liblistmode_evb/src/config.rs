use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::thread;

use super::error::ConfigError;

/// Hard ceiling on the worker count, matching the validation range [1, 128].
pub const MAX_THREADS: i32 = 128;

/// Application configuration read from `settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "Directory")]
    pub directory: PathBuf,
    #[serde(rename = "RunNumber")]
    pub run_number: u32,
    #[serde(rename = "StartVersion")]
    pub start_version: u32,
    #[serde(rename = "EndVersion")]
    pub end_version: u32,
    #[serde(rename = "TimeWindow")]
    pub time_window: f64,
    #[serde(rename = "CoincidenceWindow")]
    pub coincidence_window: f64,
    #[serde(rename = "ChannelSettings")]
    pub channel_settings_path: PathBuf,
    #[serde(rename = "L2Settings")]
    pub l2_settings_path: PathBuf,
    #[serde(rename = "NumberOfThread")]
    pub n_threads: i32,
    #[serde(rename = "TimeReferenceMod")]
    pub time_reference_mod: u32,
    #[serde(rename = "TimeReferenceCh")]
    pub time_reference_ch: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            run_number: 0,
            start_version: 0,
            end_version: 0,
            time_window: 1000.0,
            coincidence_window: 1000.0,
            channel_settings_path: PathBuf::from("chSettings.json"),
            l2_settings_path: PathBuf::from("L2Settings.json"),
            n_threads: 0,
            time_reference_mod: 9,
            time_reference_ch: 0,
        }
    }
}

impl Config {
    /// Read the configuration from a JSON file.
    /// Returns a Config if successful.
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }
        let json_str = std::fs::read_to_string(config_path)?;
        Ok(serde_json::from_str::<Self>(&json_str)?)
    }

    /// Write a default configuration template.
    pub fn write_template(path: &Path) -> Result<(), ConfigError> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &Config::default())?;
        Ok(())
    }

    /// Discover the input hit files for the configured run.
    ///
    /// For each version in `[start_version, end_version]` the directory is
    /// scanned for the first `.dat` file whose name carries the zero-padded
    /// `run<RRRR>_<VVVV>_` key; the legacy unpadded form is also recognized.
    /// Versions with no matching file are skipped.
    pub fn find_run_files(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let no_match = || ConfigError::NoMatchingFiles {
            dir: self.directory.clone(),
            run: self.run_number,
            start: self.start_version,
            end: self.end_version,
        };

        if !self.directory.exists() {
            return Err(ConfigError::BadFilePath(self.directory.clone()));
        }

        let mut all_files: Vec<PathBuf> = Vec::new();
        for item in self.directory.read_dir()? {
            let path = item?.path();
            if path.is_file() {
                all_files.push(path);
            }
        }
        all_files.sort();

        let mut file_list = Vec::new();
        for version in self.start_version..=self.end_version {
            let key = format!("run{:04}_{:04}_", self.run_number, version);
            let legacy_key = format!("run{}_{}_", self.run_number, version);
            let matched = all_files.iter().find(|path| {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    return false;
                };
                if !name.ends_with(".dat") {
                    return false;
                }
                name.contains(&key) || name.contains(&legacy_key)
            });
            if let Some(path) = matched {
                file_list.push(path.clone());
            }
        }

        if file_list.is_empty() {
            return Err(no_match());
        }
        Ok(file_list)
    }

    /// Resolve the worker count: 0 means hardware concurrency; explicit
    /// values must lie in [1, 128]; the result never exceeds the number of
    /// input files.
    pub fn resolve_threads(&self, n_files: usize) -> Result<usize, ConfigError> {
        let resolved = if self.n_threads == 0 {
            let hw = thread::available_parallelism()
                .map(|n| n.get() as i32)
                .unwrap_or(1);
            hw.min(MAX_THREADS)
        } else {
            if self.n_threads < 1 || self.n_threads > MAX_THREADS {
                return Err(ConfigError::BadThreadCount(self.n_threads));
            }
            self.n_threads
        };
        Ok((resolved as usize).min(n_files).max(1))
    }
}
