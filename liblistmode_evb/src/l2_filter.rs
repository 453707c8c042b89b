use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use super::cancel::CancelToken;
use super::error::FilterError;
use super::event_file::{EventReader, EventWriter};
use super::l2_rules::RuleSet;
use super::worker_status::WorkerStatus;

const CANCEL_POLL_EVENTS: u64 = 1024;

/// Stage three of the pipeline: per-event tag counting, flag evaluation and
/// logical acceptance over the L1 shards.
///
/// Workers are pinned one-to-one to input shards; each holds its own rule-set
/// instance so evaluation never shares mutable state. Worker `i` reads
/// `L1_<i>.dat` and writes the surviving events, with counter and flag
/// snapshots, to `L2_<i>.dat`.
pub struct L2Filter {
    rules: RuleSet,
    input_dir: PathBuf,
    output_dir: PathBuf,
    cancel: CancelToken,
}

impl L2Filter {
    pub fn new(rules: RuleSet, cancel: CancelToken) -> Self {
        Self {
            rules,
            input_dir: PathBuf::from("."),
            output_dir: PathBuf::from("."),
            cancel,
        }
    }

    /// Directory scanned for `L1_<i>.dat` shards.
    pub fn with_input_dir(mut self, dir: &Path) -> Self {
        self.input_dir = dir.to_path_buf();
        self
    }

    /// Directory receiving the `L2_<i>.dat` shards.
    pub fn with_output_dir(mut self, dir: &Path) -> Self {
        self.output_dir = dir.to_path_buf();
        self
    }

    /// Probe for consecutively numbered L1 shards, stopping at the first
    /// missing index.
    pub fn discover_shards(dir: &Path) -> Vec<PathBuf> {
        let mut shards = Vec::new();
        for index in 0.. {
            let path = dir.join(format!("L1_{index}.dat"));
            if !path.exists() {
                break;
            }
            shards.push(path);
        }
        shards
    }

    /// Filter every shard, one worker per shard.
    pub fn run(&self, tx: Sender<WorkerStatus>) -> Result<(), FilterError> {
        let shards = Self::discover_shards(&self.input_dir);
        if shards.is_empty() {
            return Err(FilterError::NoInputFiles(self.input_dir.clone()));
        }
        log::info!("Filtering {} L1 shards", shards.len());

        let results: Vec<Result<(), FilterError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = shards
                .iter()
                .enumerate()
                .map(|(worker_id, path)| {
                    let tx = tx.clone();
                    let rules = self.rules.clone();
                    scope.spawn(move || self.worker(worker_id, path, rules, tx))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(_) => {
                        log::error!("An L2 worker panicked");
                        Ok(())
                    }
                })
                .collect()
        });
        for result in results {
            result?;
        }
        Ok(())
    }

    fn worker(
        &self,
        worker_id: usize,
        path: &Path,
        mut rules: RuleSet,
        tx: Sender<WorkerStatus>,
    ) -> Result<(), FilterError> {
        log::info!("Worker {worker_id} processing file: {}", path.display());
        let mut reader = match EventReader::open(path) {
            Ok(reader) => reader,
            Err(e) => {
                log::error!("Could not open shard {}: {e}", path.display());
                return Ok(());
            }
        };
        let out_path = self.output_dir.join(format!("L2_{worker_id}.dat"));
        let mut writer = EventWriter::create(&out_path)?;

        let mut n_read: u64 = 0;
        let mut n_kept: u64 = 0;
        loop {
            if n_read % CANCEL_POLL_EVENTS == 0 {
                if self.cancel.is_cancelled() {
                    log::info!(
                        "Worker {worker_id} cancelled by user after {n_read} events"
                    );
                    break;
                }
                tx.send(WorkerStatus::new(reader.progress(), worker_id))?;
            }
            let event = match reader.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Error reading {}: {e}; stopping this shard", path.display());
                    break;
                }
            };
            n_read += 1;

            if rules.evaluate(&event) {
                writer.write_event_with_snapshots(
                    &event,
                    &rules.counter_snapshot(),
                    &rules.flag_snapshot(),
                )?;
                n_kept += 1;
            }
        }

        writer.flush()?;
        tx.send(WorkerStatus::new(1.0, worker_id))?;
        log::info!("Worker {worker_id} kept {n_kept} of {n_read} events");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_settings::{ChannelConfig, ChannelSetting};
    use crate::event::{Event, EventHit};
    use crate::event_file::EventWriter;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn tagged_channel(module: u32, ch: u32, id: i32, tag: &str) -> ChannelSetting {
        serde_json::from_value(serde_json::json!({
            "IsEventTrigger": false, "ID": id, "Module": module, "Channel": ch,
            "ThresholdADC": 0, "HasAC": false, "ACModule": 128, "ACChannel": 128,
            "Phi": 0.0, "Theta": 0.0, "Distance": 0.0,
            "x": 0.0, "y": 0.0, "z": 0.0,
            "p0": 0.0, "p1": 1.0, "p2": 0.0, "p3": 0.0,
            "DetectorType": "si", "Tags": [tag],
        }))
        .unwrap()
    }

    fn hit(module: u8, channel: u8, time_ns: f64) -> EventHit {
        EventHit {
            module,
            channel,
            charge_long: 100,
            charge_short: 10,
            time_ns,
            with_ac: false,
        }
    }

    #[test]
    fn filters_shards_and_snapshots_counters() {
        let dir = tempdir().unwrap();
        let channels = ChannelConfig::from_channels(vec![
            vec![tagged_channel(0, 0, 0, "E_Sector")],
            vec![tagged_channel(1, 0, 1, "dE_Sector")],
        ]);

        let rules_path = dir.path().join("L2Settings.json");
        std::fs::write(
            &rules_path,
            r#"[
                {"Type": "Counter", "Name": "E_Sector", "Tags": ["E_Sector"]},
                {"Type": "Counter", "Name": "dE_Sector", "Tags": ["dE_Sector"]},
                {"Type": "Flag", "Name": "E_Pos", "Monitor": "E_Sector", "Operator": ">", "Value": 0},
                {"Type": "Flag", "Name": "dE_Pos", "Monitor": "dE_Sector", "Operator": ">", "Value": 0},
                {"Type": "Accept", "Name": "Si_Both", "Monitor": ["E_Pos", "dE_Pos"], "Operator": "AND"}
            ]"#,
        )
        .unwrap();
        let rules = RuleSet::load(&rules_path, &channels).unwrap();

        // Shard 0: one passing event, one failing event.
        let mut writer = EventWriter::create(&dir.path().join("L1_0.dat")).unwrap();
        let passing = Event {
            trigger_time_ns: 10.0,
            hits: vec![hit(0, 0, 0.0), hit(1, 0, 5.0)],
        };
        let failing = Event {
            trigger_time_ns: 20.0,
            hits: vec![hit(0, 0, 0.0), hit(0, 0, 3.0)],
        };
        writer.write_event(&passing).unwrap();
        writer.write_event(&failing).unwrap();
        writer.flush().unwrap();

        let filter = L2Filter::new(rules, CancelToken::new())
            .with_input_dir(dir.path())
            .with_output_dir(dir.path());
        let (tx, _rx) = mpsc::channel();
        filter.run(tx).unwrap();

        let mut reader = EventReader::open(&dir.path().join("L2_0.dat")).unwrap();
        let (event, counters, flags) = reader.next_event_with_snapshots(2, 2).unwrap().unwrap();
        assert_eq!(event, passing);
        assert_eq!(counters, vec![1, 1]);
        assert_eq!(flags, vec![true, true]);
        assert!(reader.next_event_with_snapshots(2, 2).unwrap().is_none());
    }

    #[test]
    fn missing_shards_are_an_error() {
        let dir = tempdir().unwrap();
        let filter = L2Filter::new(RuleSet::default(), CancelToken::new())
            .with_input_dir(dir.path());
        let (tx, _rx) = mpsc::channel();
        assert!(matches!(
            filter.run(tx),
            Err(FilterError::NoInputFiles(_))
        ));
    }
}
