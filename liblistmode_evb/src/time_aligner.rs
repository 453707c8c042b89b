use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Mutex, PoisonError};

use super::cancel::CancelToken;
use super::channel_settings::ChannelConfig;
use super::error::{AlignerError, HitFileError};
use super::histogram::{Hist1D, Hist2D};
use super::hit::RawHit;
use super::hit_file::HitFile;
use super::offset_table::OffsetTable;
use super::worker_status::WorkerStatus;

/// Output file holding the derived per-pair time offsets.
pub const TIME_SETTINGS_FILE: &str = "timeSettings.json";
/// Binary dump of the merged non-empty histograms, for offline inspection.
pub const HISTOGRAM_DUMP_FILE: &str = "timeAlignment.dat";

const CHUNK_SIZE: u64 = 10_000_000;
const ADC_BINS: usize = 32000;

/// One full set of alignment histograms: a 2-D time-difference histogram and
/// an ADC spectrum per configured channel.
///
/// Each worker owns a set of its own; merging is bin-wise addition, done by
/// the coordinator in worker-id order after all workers have joined.
struct HistogramSet {
    time: Vec<Vec<Hist2D>>,
    adc: Vec<Vec<Hist1D>>,
}

impl HistogramSet {
    fn new(channels: &ChannelConfig, time_window: f64) -> Self {
        let n_id_bins = channels.max_id().max(0) as usize + 1;
        let n_time_bins = (2.0 * time_window).ceil() as usize;
        let time = (0..channels.n_modules())
            .map(|module| {
                (0..channels.n_channels(module))
                    .map(|channel| {
                        Hist2D::new(
                            format!("hTime_{module:02}_{channel:02}"),
                            n_time_bins,
                            -time_window,
                            time_window,
                            n_id_bins,
                            0.0,
                            n_id_bins as f64,
                        )
                    })
                    .collect()
            })
            .collect();
        let adc = (0..channels.n_modules())
            .map(|module| {
                (0..channels.n_channels(module))
                    .map(|channel| {
                        Hist1D::new(
                            format!("hADC_{module:02}_{channel:02}"),
                            ADC_BINS,
                            0.0,
                            ADC_BINS as f64,
                        )
                    })
                    .collect()
            })
            .collect();
        Self { time, adc }
    }

    fn merge_from(&mut self, other: &HistogramSet) {
        for (dst_row, src_row) in self.time.iter_mut().zip(other.time.iter()) {
            for (dst, src) in dst_row.iter_mut().zip(src_row.iter()) {
                dst.add(src);
            }
        }
        for (dst_row, src_row) in self.adc.iter_mut().zip(other.adc.iter()) {
            for (dst, src) in dst_row.iter_mut().zip(src_row.iter()) {
                dst.add(src);
            }
        }
    }
}

/// Stage one of the pipeline: build time-difference histograms between every
/// trigger channel and every other channel, locate the peaks and write the
/// per-pair offset table consumed by the L1 build.
pub struct TimeAligner {
    channels: ChannelConfig,
    file_list: Vec<PathBuf>,
    time_window: f64,
    output_dir: PathBuf,
    shared_histograms: bool,
    cancel: CancelToken,
}

impl TimeAligner {
    pub fn new(
        channels: ChannelConfig,
        file_list: Vec<PathBuf>,
        time_window: f64,
        cancel: CancelToken,
    ) -> Self {
        Self {
            channels,
            file_list,
            time_window,
            output_dir: PathBuf::from("."),
            shared_histograms: false,
            cancel,
        }
    }

    /// Directory receiving `timeSettings.json` and the histogram dump.
    pub fn with_output_dir(mut self, dir: &Path) -> Self {
        self.output_dir = dir.to_path_buf();
        self
    }

    /// Switch to the mutex-protected shared-histogram variant. Thread-local
    /// sets merged after the join are the default.
    pub fn with_shared_histograms(mut self, shared: bool) -> Self {
        self.shared_histograms = shared;
        self
    }

    /// Fill the histograms across `n_threads` workers, extract the peaks and
    /// write the offset table.
    pub fn run(
        &self,
        n_threads: usize,
        tx: Sender<WorkerStatus>,
    ) -> Result<OffsetTable, AlignerError> {
        if self.file_list.is_empty() {
            return Err(AlignerError::NoInputFiles);
        }
        let n_threads = n_threads.clamp(1, crate::config::MAX_THREADS as usize);
        let total_bytes: u64 = self
            .file_list
            .iter()
            .filter_map(|p| p.metadata().ok().map(|m| m.len()))
            .sum();
        log::info!(
            "Aligning {} files, {} total, with {} workers",
            self.file_list.len(),
            human_bytes::human_bytes(total_bytes as f64),
            n_threads
        );

        let merged = self.fill_histograms(n_threads, tx)?;
        if let Err(e) = self.save_histograms(&merged) {
            log::warn!("Could not save the histogram dump: {e}");
        }

        let table = self.calculate_offsets(&merged);
        let table_path = self.output_dir.join(TIME_SETTINGS_FILE);
        table.save(&table_path)?;
        log::info!("{} generated", table_path.display());
        Ok(table)
    }

    fn fill_histograms(
        &self,
        n_threads: usize,
        tx: Sender<WorkerStatus>,
    ) -> Result<HistogramSet, AlignerError> {
        let queue: Mutex<VecDeque<PathBuf>> = Mutex::new(self.file_list.iter().cloned().collect());
        let files_done = AtomicUsize::new(0);
        let shared = if self.shared_histograms {
            Some(Mutex::new(HistogramSet::new(&self.channels, self.time_window)))
        } else {
            None
        };

        let mut merged = HistogramSet::new(&self.channels, self.time_window);
        let worker_results: Vec<Result<Option<HistogramSet>, AlignerError>> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = (0..n_threads)
                    .map(|worker_id| {
                        let tx = tx.clone();
                        let queue = &queue;
                        let files_done = &files_done;
                        let shared = shared.as_ref();
                        scope.spawn(move || self.worker(worker_id, queue, shared, files_done, tx))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| match handle.join() {
                        Ok(result) => result,
                        Err(_) => {
                            log::error!("A time-aligner worker panicked");
                            Ok(None)
                        }
                    })
                    .collect()
            });

        // Deterministic merge order: worker id.
        for result in worker_results {
            if let Some(set) = result? {
                merged.merge_from(&set);
            }
        }
        if let Some(mutex) = shared {
            let set = mutex.into_inner().unwrap_or_else(PoisonError::into_inner);
            merged.merge_from(&set);
        }
        Ok(merged)
    }

    /// Worker loop: pop files off the shared queue until it drains or the
    /// run is cancelled.
    fn worker(
        &self,
        worker_id: usize,
        queue: &Mutex<VecDeque<PathBuf>>,
        shared: Option<&Mutex<HistogramSet>>,
        files_done: &AtomicUsize,
        tx: Sender<WorkerStatus>,
    ) -> Result<Option<HistogramSet>, AlignerError> {
        let mut local = if shared.is_none() {
            Some(HistogramSet::new(&self.channels, self.time_window))
        } else {
            None
        };
        let n_files = self.file_list.len();

        loop {
            if self.cancel.is_cancelled() {
                log::info!("Worker {worker_id} cancelled by user");
                break;
            }
            let Some(path) = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            else {
                break;
            };
            log::info!("Worker {worker_id} processing file: {}", path.display());

            let mut file = match HitFile::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    log::error!("Could not open file {}: {e}", path.display());
                    continue;
                }
            };
            if let Err(e) = self.fill_from_file(&mut file, local.as_mut(), shared) {
                log::error!("Error reading {}: {e}; skipping the rest of it", path.display());
            }

            let done = files_done.fetch_add(1, Ordering::AcqRel) + 1;
            tx.send(WorkerStatus::new(done as f32 / n_files as f32, worker_id))?;
        }
        Ok(local)
    }

    fn fill_from_file(
        &self,
        file: &mut HitFile,
        mut local: Option<&mut HistogramSet>,
        shared: Option<&Mutex<HistogramSet>>,
    ) -> Result<(), HitFileError> {
        let n_entries = file.n_entries();
        let mut chunk_start = 0u64;
        while chunk_start < n_entries {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let chunk_end = (chunk_start + CHUNK_SIZE).min(n_entries);
            let raws = file.read_range(chunk_start, chunk_end)?;
            match (&mut local, shared) {
                (Some(set), _) => self.fill_chunk(&raws, set),
                (None, Some(mutex)) => {
                    let mut set = mutex.lock().unwrap_or_else(PoisonError::into_inner);
                    self.fill_chunk(&raws, &mut set);
                }
                (None, None) => unreachable!("worker always has one histogram target"),
            }
            chunk_start = chunk_end;
        }
        Ok(())
    }

    /// Fill one chunk: threshold and configuration filtering, a sort by
    /// timestamp, then the symmetric coincidence scan around every trigger
    /// hit.
    fn fill_chunk(&self, raws: &[RawHit], set: &mut HistogramSet) {
        let mut data: Vec<(u8, u8, f64)> = Vec::with_capacity(raws.len());
        for raw in raws {
            let Some(setting) = self.channels.get(raw.module, raw.channel) else {
                continue;
            };
            if raw.charge_long > setting.threshold_adc {
                set.adc[raw.module as usize][raw.channel as usize].fill(raw.charge_long as f64);
                data.push((raw.module, raw.channel, raw.time_ns()));
            }
        }
        data.sort_by(|a, b| a.2.total_cmp(&b.2));

        for i in 0..data.len() {
            let (module, channel, time) = data[i];
            let Some(setting) = self.channels.get(module, channel) else {
                continue;
            };
            if !setting.is_event_trigger {
                continue;
            }
            let hist = &mut set.time[module as usize][channel as usize];
            for &(other_mod, other_ch, other_time) in data.iter().skip(i + 1) {
                let diff = other_time - time;
                if diff > self.time_window {
                    break;
                }
                if let Some(other) = self.channels.get(other_mod, other_ch) {
                    hist.fill(diff, other.id.max(0) as f64);
                }
            }
            for &(other_mod, other_ch, other_time) in data.iter().take(i).rev() {
                let diff = other_time - time;
                if diff < -self.time_window {
                    break;
                }
                if let Some(other) = self.channels.get(other_mod, other_ch) {
                    hist.fill(diff, other.id.max(0) as f64);
                }
            }
        }
    }

    /// Derive the offset table from the merged histograms: for every pair,
    /// project the partner channel's id bin, rebin by detector species and
    /// take the center of the maximum bin. Empty projections give offset 0;
    /// the diagonal is forced to 0.
    fn calculate_offsets(&self, merged: &HistogramSet) -> OffsetTable {
        let n_modules = self.channels.n_modules();
        let mut offsets: Vec<Vec<Vec<Vec<f64>>>> = (0..n_modules)
            .map(|ref_mod| {
                vec![
                    (0..n_modules)
                        .map(|module| vec![0.0; self.channels.n_channels(module)])
                        .collect();
                    self.channels.n_channels(ref_mod)
                ]
            })
            .collect();

        for (ref_mod, ref_row) in merged.time.iter().enumerate() {
            for (ref_ch, hist) in ref_row.iter().enumerate() {
                for module in 0..n_modules {
                    for channel in 0..self.channels.n_channels(module) {
                        let Some(setting) = self.channels.get(module as u8, channel as u8) else {
                            continue;
                        };
                        let projection = hist
                            .projection_x(
                                setting.id.max(0) as usize,
                                format!("hpx_{:04}", setting.id),
                            )
                            .rebin(setting.detector_type().rebin_factor());
                        if projection.entries() == 0 {
                            continue;
                        }
                        let offset = projection.bin_center(projection.max_bin());
                        offsets[ref_mod][ref_ch][module][channel] = offset;
                        log::info!(
                            "{ref_mod} {ref_ch} {module} {channel} TimeOffset: {offset}"
                        );
                    }
                }
            }
        }

        OffsetTable::from_offsets(offsets)
    }

    /// Dump every non-empty merged histogram to the binary diagnostics file.
    fn save_histograms(&self, merged: &HistogramSet) -> std::io::Result<()> {
        let path = self.output_dir.join(HISTOGRAM_DUMP_FILE);
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(b"LMHD")?;
        writer.write_all(&1u16.to_le_bytes())?;
        for hist in merged.time.iter().flatten() {
            if hist.entries() > 0 {
                hist.write_to(&mut writer)?;
            }
        }
        for hist in merged.adc.iter().flatten() {
            if hist.entries() > 0 {
                log::debug!(
                    "{}: {} entries, peak at {}",
                    hist.name(),
                    hist.entries(),
                    hist.bin_center(hist.max_bin())
                );
                hist.write_to(&mut writer)?;
            }
        }
        writer.flush()?;
        log::info!("Histograms saved to: {}", path.display());
        Ok(())
    }
}
