use std::path::PathBuf;
use thiserror::Error;

use super::worker_status::WorkerStatus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse JSON: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("Thread count must be between 1 and 128, got: {0}")]
    BadThreadCount(i32),
    #[error("No input files matching run {run} versions {start}..={end} found in {dir:?}")]
    NoMatchingFiles {
        dir: PathBuf,
        run: u32,
        start: u32,
        end: u32,
    },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to load channel settings as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Channel settings failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Channel settings failed to parse JSON: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("No channel settings found in file {0:?}")]
    Empty(PathBuf),
}

#[derive(Debug, Error)]
pub enum OffsetTableError {
    #[error("Failed to load time settings as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Time settings failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Time settings failed to parse JSON: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("No time settings found in file {0:?}")]
    Empty(PathBuf),
    #[error(
        "Reference channel (module {module}, channel {channel}) is out of bounds for a \
         time-offset table of {n_modules} modules; regenerate the table or fix the reference"
    )]
    ReferenceOutOfRange {
        module: u32,
        channel: u32,
        n_modules: usize,
    },
}

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("Failed to load selection rules as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Selection rules failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Selection rules failed to parse JSON: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("Unknown comparison operator in selection rules: {0}")]
    UnknownCompareOp(String),
    #[error("Unknown logical operator in selection rules: {0}")]
    UnknownLogicOp(String),
}

#[derive(Debug, Error)]
pub enum HitFileError {
    #[error("Could not open hit file because {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Hit file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EventFileError {
    #[error("Could not open event file because {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Event file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Event file is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum AlignerError {
    #[error("TimeAligner failed due to channel settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("TimeAligner failed due to time settings error: {0}")]
    OffsetTable(#[from] OffsetTableError),
    #[error("TimeAligner was given an empty file list")]
    NoInputFiles,
    #[error("TimeAligner failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("TimeAligner failed due to send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
}

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("L1 builder failed due to channel settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("L1 builder failed due to time settings error: {0}")]
    OffsetTable(#[from] OffsetTableError),
    #[error("L1 builder failed due to event file error: {0}")]
    EventFile(#[from] EventFileError),
    #[error("L1 builder was given an empty file list")]
    NoInputFiles,
    #[error("L1 builder failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("L1 builder failed due to send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("L2 filter failed due to selection rules error: {0}")]
    Rules(#[from] RulesError),
    #[error("L2 filter failed due to event file error: {0}")]
    EventFile(#[from] EventFileError),
    #[error("L2 filter found no L1 shards in {0:?}")]
    NoInputFiles(PathBuf),
    #[error("L2 filter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("L2 filter failed due to send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
}
