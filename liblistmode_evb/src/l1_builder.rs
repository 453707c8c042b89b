use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use super::cancel::CancelToken;
use super::channel_settings::ChannelConfig;
use super::error::BuilderError;
use super::event::{Event, EventHit};
use super::event_file::EventWriter;
use super::hit::{Hit, RawHit};
use super::hit_file::HitFile;
use super::offset_table::OffsetTable;
use super::worker_status::WorkerStatus;

// Chunked processing configuration, bounding per-worker resident memory.
const CHUNK_SIZE: u64 = 10_000_000;
const OVERLAP_SIZE: usize = 10_000;

/// Stage two of the pipeline: time-corrected coincidence grouping.
///
/// Input files are statically distributed round-robin across the workers;
/// worker `i` owns the output shard `L1_<i>.dat`. Within a file, entries are
/// processed in chunks with an overlap on each side so that triggers near a
/// chunk edge still see their full coincidence window. The trailing overlap
/// of each file is carried into the next file of the same worker, giving
/// early triggers there backward context, unless an acquisition reset is
/// detected at the boundary.
pub struct L1Builder {
    channels: ChannelConfig,
    offsets: OffsetTable,
    ref_mod: u32,
    ref_ch: u32,
    coincidence_window: f64,
    file_list: Vec<PathBuf>,
    output_dir: PathBuf,
    chunk_size: u64,
    overlap_size: usize,
    cancel: CancelToken,
}

impl L1Builder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: ChannelConfig,
        offsets: OffsetTable,
        ref_mod: u32,
        ref_ch: u32,
        coincidence_window: f64,
        file_list: Vec<PathBuf>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            channels,
            offsets,
            ref_mod,
            ref_ch,
            coincidence_window,
            file_list,
            output_dir: PathBuf::from("."),
            chunk_size: CHUNK_SIZE,
            overlap_size: OVERLAP_SIZE,
            cancel,
        }
    }

    /// Directory receiving the `L1_<i>.dat` shards.
    pub fn with_output_dir(mut self, dir: &Path) -> Self {
        self.output_dir = dir.to_path_buf();
        self
    }

    #[cfg(test)]
    fn with_chunking(mut self, chunk_size: u64, overlap_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self.overlap_size = overlap_size;
        self
    }

    /// Build events across `n_threads` workers, one output shard each.
    pub fn run(&self, n_threads: usize, tx: Sender<WorkerStatus>) -> Result<(), BuilderError> {
        if self.file_list.is_empty() {
            return Err(BuilderError::NoInputFiles);
        }
        let n_threads = n_threads.clamp(1, crate::config::MAX_THREADS as usize);
        // Validates the reference channel against the table dimensions.
        let offsets = self.offsets.slice(self.ref_mod, self.ref_ch)?;
        log::info!(
            "Using reference: Module {}, Channel {}",
            self.ref_mod,
            self.ref_ch
        );

        let mut partitions: Vec<Vec<PathBuf>> = vec![Vec::new(); n_threads];
        for (index, path) in self.file_list.iter().enumerate() {
            partitions[index % n_threads].push(path.clone());
        }

        let results: Vec<Result<(), BuilderError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = partitions
                .into_iter()
                .enumerate()
                .map(|(worker_id, files)| {
                    let tx = tx.clone();
                    scope.spawn(move || self.worker(worker_id, files, offsets, tx))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(_) => {
                        log::error!("An L1 worker panicked");
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
        files: Vec<PathBuf>,
        offsets: &[Vec<f64>],
        tx: Sender<WorkerStatus>,
    ) -> Result<(), BuilderError> {
        let out_path = self.output_dir.join(format!("L1_{worker_id}.dat"));
        let mut writer = EventWriter::create(&out_path)?;
        let mut overlap: Vec<Hit> = Vec::new();
        let mut n_events: u64 = 0;
        let n_files = files.len();

        'files: for (file_index, path) in files.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::info!("Worker {worker_id} cancelled by user");
                break;
            }
            log::info!(
                "Worker {worker_id} reading file: {} ({}/{})",
                path.display(),
                file_index + 1,
                n_files
            );
            let mut file = match HitFile::open(path) {
                Ok(file) => file,
                Err(e) => {
                    log::error!("Could not open file {}: {e}", path.display());
                    continue;
                }
            };
            let n_entries = file.n_entries();
            if n_entries == 0 {
                continue;
            }
            log::info!(
                "Worker {worker_id}: {} entries ({}) in {} chunks",
                n_entries,
                human_bytes::human_bytes(file.size_bytes() as f64),
                n_entries.div_ceil(self.chunk_size)
            );

            // A first timestamp behind the carried buffer means the DAQ was
            // restarted between the files; coincidences must not be built
            // across that boundary.
            if let Some(last) = overlap.last() {
                match file.read_entry(0) {
                    Ok(first) => {
                        let t_first = self.corrected_time(&first, offsets);
                        if t_first < last.time_ns {
                            log::warn!(
                                "Acquisition reset detected at {}; clearing the overlap buffer",
                                path.display()
                            );
                            overlap.clear();
                        }
                    }
                    Err(e) => {
                        log::error!("Could not read {}: {e}", path.display());
                        continue;
                    }
                }
            }

            let num_chunks = n_entries.div_ceil(self.chunk_size);
            for chunk_index in 0..num_chunks {
                if self.cancel.is_cancelled() {
                    log::info!("Worker {worker_id} cancelled during chunked processing");
                    break 'files;
                }
                let chunk_start = chunk_index * self.chunk_size;
                let chunk_end = (chunk_start + self.chunk_size).min(n_entries);
                let read_start = chunk_start.saturating_sub(self.overlap_size as u64);
                let read_end = (chunk_end + self.overlap_size as u64).min(n_entries);

                let raws = match file.read_range(read_start, read_end) {
                    Ok(raws) => raws,
                    Err(e) => {
                        log::error!(
                            "Error reading {}: {e}; skipping the rest of it",
                            path.display()
                        );
                        continue 'files;
                    }
                };

                let mut merged: Vec<Hit> = Vec::with_capacity(raws.len() + overlap.len());
                if chunk_index == 0 {
                    // Cross-file context; later chunks get their leading
                    // context from the overlap re-read instead.
                    merged.append(&mut overlap);
                }
                for (offset_index, raw) in raws.iter().enumerate() {
                    let Some(setting) = self.channels.get(raw.module, raw.channel) else {
                        continue;
                    };
                    if raw.module as usize >= offsets.len()
                        || raw.channel as usize >= offsets[raw.module as usize].len()
                    {
                        continue;
                    }
                    if raw.charge_long > setting.threshold_adc {
                        let entry = read_start + offset_index as u64;
                        merged.push(Hit::from_raw(
                            raw,
                            self.corrected_time(raw, offsets),
                            entry as i64,
                        ));
                    }
                }
                merged.sort_by(|a, b| a.time_ns.total_cmp(&b.time_ns));

                n_events +=
                    self.build_events(&merged, chunk_start as i64, chunk_end as i64, &mut writer)?;

                // Deep copy of the trailing entries; the chunk buffer is
                // about to be dropped. Carried hits are context only.
                let tail_start = merged.len().saturating_sub(self.overlap_size);
                overlap.clear();
                overlap.extend(merged[tail_start..].iter().map(|hit| Hit {
                    entry: -1,
                    ..*hit
                }));

                tx.send(WorkerStatus::new(
                    (file_index as f32 + (chunk_index + 1) as f32 / num_chunks as f32)
                        / n_files as f32,
                    worker_id,
                ))?;
            }
        }

        writer.flush()?;
        tx.send(WorkerStatus::new(1.0, worker_id))?;
        log::info!("Worker {worker_id} finished writing {n_events} events");
        Ok(())
    }

    fn corrected_time(&self, raw: &RawHit, offsets: &[Vec<f64>]) -> f64 {
        let offset = offsets
            .get(raw.module as usize)
            .and_then(|row| row.get(raw.channel as usize))
            .copied()
            .unwrap_or(0.0);
        raw.time_ns() - offset
    }

    /// Walk the sorted merged buffer and emit one event per surviving
    /// trigger whose entry index lies in `[scope_lo, scope_hi)`.
    fn build_events(
        &self,
        merged: &[Hit],
        scope_lo: i64,
        scope_hi: i64,
        writer: &mut EventWriter,
    ) -> Result<u64, BuilderError> {
        let window = self.coincidence_window;
        let mut written = 0u64;

        for (i, hit) in merged.iter().enumerate() {
            if hit.entry < scope_lo || hit.entry >= scope_hi {
                continue;
            }
            let Some(setting) = self.channels.get(hit.module, hit.channel) else {
                continue;
            };
            if !setting.is_event_trigger {
                continue;
            }
            let trigger_id = setting.id;
            let trigger_time = hit.time_ns;

            let mut hits = vec![EventHit {
                module: hit.module,
                channel: hit.channel,
                charge_long: hit.charge_long,
                charge_short: hit.charge_short,
                time_ns: 0.0,
                with_ac: false,
            }];
            let mut keep = true;

            for peer in &merged[i + 1..] {
                let diff = peer.time_ns - trigger_time;
                if diff >= window {
                    break;
                }
                let Some(peer_setting) = self.channels.get(peer.module, peer.channel) else {
                    continue;
                };
                // A later trigger of equal or higher priority claims these
                // hits; abandon this event.
                if peer_setting.is_event_trigger && peer_setting.id >= trigger_id && diff < window {
                    keep = false;
                    break;
                }
                hits.push(EventHit {
                    module: peer.module,
                    channel: peer.channel,
                    charge_long: peer.charge_long,
                    charge_short: peer.charge_short,
                    time_ns: diff,
                    with_ac: false,
                });
            }
            if keep {
                for peer in merged[..i].iter().rev() {
                    let diff = peer.time_ns - trigger_time;
                    if diff <= -window {
                        break;
                    }
                    let Some(peer_setting) = self.channels.get(peer.module, peer.channel) else {
                        continue;
                    };
                    if peer_setting.is_event_trigger
                        && peer_setting.id >= trigger_id
                        && diff > -window
                    {
                        keep = false;
                        break;
                    }
                    hits.push(EventHit {
                        module: peer.module,
                        channel: peer.channel,
                        charge_long: peer.charge_long,
                        charge_short: peer.charge_short,
                        time_ns: diff,
                        with_ac: false,
                    });
                }
            }
            if !keep {
                continue;
            }

            hits[1..].sort_by(|a, b| a.time_ns.total_cmp(&b.time_ns));
            self.tag_anti_coincidence(&mut hits);
            writer.write_event(&Event {
                trigger_time_ns: trigger_time,
                hits,
            })?;
            written += 1;
        }
        Ok(written)
    }

    /// Mark every hit whose configured anti-coincidence channel also fired
    /// inside the window.
    fn tag_anti_coincidence(&self, hits: &mut [EventHit]) {
        for index in 0..hits.len() {
            let Some(setting) = self.channels.get(hits[index].module, hits[index].channel) else {
                continue;
            };
            if !setting.has_ac {
                continue;
            }
            let fired = hits.iter().any(|ac| {
                ac.module as u32 == setting.ac_module
                    && ac.channel as u32 == setting.ac_channel
                    && ac.time_ns.abs() < self.coincidence_window
            });
            if fired {
                hits[index].with_ac = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_settings::ChannelSetting;
    use crate::event_file::EventReader;
    use crate::hit_file::HitFileWriter;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn channel(module: u32, ch: u32, id: i32, trigger: bool) -> ChannelSetting {
        serde_json::from_value(serde_json::json!({
            "IsEventTrigger": trigger, "ID": id, "Module": module, "Channel": ch,
            "ThresholdADC": 10, "HasAC": false, "ACModule": 128, "ACChannel": 128,
            "Phi": 0.0, "Theta": 0.0, "Distance": 0.0,
            "x": 0.0, "y": 0.0, "z": 0.0,
            "p0": 0.0, "p1": 1.0, "p2": 0.0, "p3": 0.0,
            "DetectorType": "pmt", "Tags": [],
        }))
        .unwrap()
    }

    /// One trigger channel (0,0) and one plain channel (0,1).
    fn simple_config() -> ChannelConfig {
        ChannelConfig::from_channels(vec![vec![
            channel(0, 0, 0, true),
            channel(0, 1, 1, false),
        ]])
    }

    fn zero_offsets(config: &ChannelConfig) -> OffsetTable {
        let n = config.n_modules();
        let offsets = (0..n)
            .map(|ref_mod| {
                vec![
                    (0..n)
                        .map(|m| vec![0.0; config.n_channels(m)])
                        .collect::<Vec<_>>();
                    config.n_channels(ref_mod)
                ]
            })
            .collect();
        OffsetTable::from_offsets(offsets)
    }

    fn write_hits(path: &std::path::Path, hits: &[(u8, u8, i64)]) {
        let mut writer = HitFileWriter::create(path).unwrap();
        for &(module, ch, t_ns) in hits {
            writer
                .write(&RawHit {
                    module,
                    channel: ch,
                    charge_long: 100,
                    charge_short: 20,
                    fine_ts_ps: t_ns * 1000,
                })
                .unwrap();
        }
        writer.flush().unwrap();
    }

    fn read_shard(path: &std::path::Path) -> Vec<Event> {
        let mut reader = EventReader::open(path).unwrap();
        let mut events = Vec::new();
        while let Some(event) = reader.next_event().unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn coincident_hit_lands_in_the_event() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("run0001_0000_t0.dat");
        // Trigger at 100 ns, partner at 500 ns, window 1000 ns.
        write_hits(&input, &[(0, 0, 100), (0, 1, 500)]);

        let config = simple_config();
        let offsets = zero_offsets(&config);
        let builder = L1Builder::new(
            config,
            offsets,
            0,
            0,
            1000.0,
            vec![input],
            CancelToken::new(),
        )
        .with_output_dir(dir.path());
        let (tx, _rx) = mpsc::channel();
        builder.run(1, tx).unwrap();

        let events = read_shard(&dir.path().join("L1_0.dat"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger_time_ns, 100.0);
        assert_eq!(events[0].hits.len(), 2);
        assert_eq!(events[0].hits[0].time_ns, 0.0);
        assert_eq!(events[0].hits[1].time_ns, 400.0);
        assert_eq!(events[0].hits[1].channel, 1);
    }

    #[test]
    fn chunk_boundary_does_not_lose_events() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("run0001_0000_t0.dat");
        // Hits 10 us apart so nothing is coincident except one pair placed
        // right at a chunk boundary: entry 3 (trigger) and entry 4 (partner
        // 50 ns later, in the next chunk).
        let mut hits: Vec<(u8, u8, i64)> = (0..4).map(|k| (0u8, 0u8, k * 10_000)).collect();
        hits.push((0, 1, 3 * 10_000 + 50));
        hits.extend((4..8).map(|k| (0u8, 0u8, k * 10_000)));
        write_hits(&input, &hits);

        let config = simple_config();
        let offsets = zero_offsets(&config);
        let builder = L1Builder::new(
            config,
            offsets,
            0,
            0,
            1000.0,
            vec![input],
            CancelToken::new(),
        )
        .with_output_dir(dir.path())
        .with_chunking(4, 2);
        let (tx, _rx) = mpsc::channel();
        builder.run(1, tx).unwrap();

        let events = read_shard(&dir.path().join("L1_0.dat"));
        // Every trigger hit survives exactly once.
        assert_eq!(events.len(), 8);
        let with_partner: Vec<_> = events.iter().filter(|e| e.hits.len() == 2).collect();
        assert_eq!(with_partner.len(), 1);
        assert_eq!(with_partner[0].trigger_time_ns, 30_000.0);
        assert_eq!(with_partner[0].hits[1].time_ns, 50.0);
    }

    #[test]
    fn window_is_open_on_both_sides() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("run0001_0000_t0.dat");
        // Partners at exactly +W and -W are excluded; at W - 1 included.
        write_hits(
            &input,
            &[(0, 1, 0), (0, 0, 100), (0, 1, 199), (0, 1, 200)],
        );

        let config = simple_config();
        let offsets = zero_offsets(&config);
        let builder = L1Builder::new(
            config,
            offsets,
            0,
            0,
            100.0,
            vec![input],
            CancelToken::new(),
        )
        .with_output_dir(dir.path());
        let (tx, _rx) = mpsc::channel();
        builder.run(1, tx).unwrap();

        let events = read_shard(&dir.path().join("L1_0.dat"));
        assert_eq!(events.len(), 1);
        let times: Vec<f64> = events[0].hits.iter().map(|h| h.time_ns).collect();
        assert_eq!(times, vec![0.0, 99.0]);
    }
}
