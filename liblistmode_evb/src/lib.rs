//! # listmode_evb
//!
//! listmode_evb builds physics events from per-channel list-mode data
//! acquired by a digital DAQ (up to ~11 digitizer modules of up to 32
//! channels each). The pipeline has three stages, each invoked as a distinct
//! run mode:
//!
//! 1. **Time alignment** (`time`): builds 2-D time-difference histograms
//!    between every trigger channel and every other channel, locates the
//!    peaks and writes a per-channel-pair offset table (`timeSettings.json`).
//! 2. **L1 event building** (`l1`): applies the offsets, sorts hits by
//!    corrected time and groups each trigger hit with all coincident hits
//!    inside a symmetric window. Overlapping triggers are suppressed by
//!    channel-id priority; hits with a firing anti-coincidence partner are
//!    tagged. One binary event shard is written per worker (`L1_<i>.dat`).
//! 3. **L2 event selection** (`l2`): evaluates tag-based counters, boolean
//!    flags and accept/reject expressions per event and writes the surviving
//!    events with counter and flag snapshots (`L2_<i>.dat`).
//!
//! ## Input data
//!
//! Input files are flat little-endian sequences of 14-byte hit records
//! (module, channel, long and short charge, picosecond timestamp), named
//! `run<RRRR>_<VVVV>_*.dat` per run and acquisition version. Files are
//! processed in chunks of ten million entries, so datasets of hundreds of
//! millions of hits run in bounded memory.
//!
//! ## Configuration
//!
//! A single `settings.json` drives all stages:
//!
//! ```json
//! {
//!   "Directory": "/data/run42",
//!   "RunNumber": 42,
//!   "StartVersion": 0,
//!   "EndVersion": 10,
//!   "TimeWindow": 1000.0,
//!   "CoincidenceWindow": 1000.0,
//!   "ChannelSettings": "chSettings.json",
//!   "L2Settings": "L2Settings.json",
//!   "NumberOfThread": 0,
//!   "TimeReferenceMod": 9,
//!   "TimeReferenceCh": 0
//! }
//! ```
//!
//! `NumberOfThread: 0` selects the hardware concurrency, capped at 128.
//! The channel settings file is an array of per-module arrays of channel
//! records (trigger flag, id, ADC threshold, anti-coincidence partner,
//! detector type, tags, calibration and geometry). The L2 settings file is
//! an ordered list of `Counter`, `Flag` and `Accept` rules.
//!
//! ## Concurrency
//!
//! All stages run plain OS threads over shared-nothing work: the time
//! aligner pulls files from a mutex-protected queue into thread-local
//! histograms that are merged after the join; the L1 builder partitions
//! files round-robin with one output shard per worker; the L2 filter pins
//! one worker per shard. A [`cancel::CancelToken`] set from a SIGINT handler
//! stops every worker at the next file, chunk or event boundary, leaving
//! partial but consistent shards behind.

pub mod cancel;
pub mod channel_settings;
pub mod config;
pub mod error;
pub mod event;
pub mod event_file;
pub mod histogram;
pub mod hit;
pub mod hit_file;
pub mod l1_builder;
pub mod l2_filter;
pub mod l2_rules;
pub mod offset_table;
pub mod time_aligner;
pub mod worker_status;
