use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::error::EventFileError;
use super::event::{Event, EventHit};

const HIT_RECORD_SIZE: usize = 15;

/// Writer for the per-worker binary event shards.
///
/// An L1 record is `trigger_time (f64)`, `n_hits (u32)` and one 15-byte hit
/// record per hit. An L2 record appends one `u64` per declared counter and
/// one byte per declared flag, in rule-declaration order. All fields are
/// little endian; the files carry no header.
#[derive(Debug)]
pub struct EventWriter {
    writer: BufWriter<File>,
}

impl EventWriter {
    pub fn create(path: &Path) -> Result<Self, EventFileError> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    pub fn write_event(&mut self, event: &Event) -> Result<(), EventFileError> {
        self.writer
            .write_all(&event.trigger_time_ns.to_le_bytes())?;
        self.writer
            .write_all(&(event.hits.len() as u32).to_le_bytes())?;
        for hit in &event.hits {
            let mut buf = [0u8; HIT_RECORD_SIZE];
            buf[0] = hit.module;
            buf[1] = hit.channel;
            buf[2..4].copy_from_slice(&hit.charge_long.to_le_bytes());
            buf[4..6].copy_from_slice(&hit.charge_short.to_le_bytes());
            buf[6..14].copy_from_slice(&hit.time_ns.to_le_bytes());
            buf[14] = hit.with_ac as u8;
            self.writer.write_all(&buf)?;
        }
        Ok(())
    }

    /// Write an event followed by the counter and flag snapshots of the rule
    /// set that accepted it.
    pub fn write_event_with_snapshots(
        &mut self,
        event: &Event,
        counters: &[u64],
        flags: &[bool],
    ) -> Result<(), EventFileError> {
        self.write_event(event)?;
        for &count in counters {
            self.writer.write_all(&count.to_le_bytes())?;
        }
        for &flag in flags {
            self.writer.write_all(&[flag as u8])?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), EventFileError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reader over one event shard.
#[derive(Debug)]
pub struct EventReader {
    reader: BufReader<File>,
    size_bytes: u64,
    consumed: u64,
    path: PathBuf,
}

impl EventReader {
    pub fn open(path: &Path) -> Result<Self, EventFileError> {
        if !path.exists() {
            return Err(EventFileError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let size_bytes = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            size_bytes,
            consumed: 0,
            path: path.to_path_buf(),
        })
    }

    /// Fraction of the file consumed so far.
    pub fn progress(&self) -> f32 {
        if self.size_bytes == 0 {
            1.0
        } else {
            self.consumed as f32 / self.size_bytes as f32
        }
    }

    /// Read the next L1 record. Returns `None` at a clean end of file; a
    /// record truncated mid-way is reported as corrupt.
    pub fn next_event(&mut self) -> Result<Option<Event>, EventFileError> {
        let mut time_buf = [0u8; 8];
        if !self.try_fill(&mut time_buf)? {
            return Ok(None);
        }
        let trigger_time_ns = f64::from_le_bytes(time_buf);

        let n_hits = self.read_u32()? as usize;
        let mut hits = Vec::with_capacity(n_hits);
        for _ in 0..n_hits {
            let mut buf = [0u8; HIT_RECORD_SIZE];
            self.fill(&mut buf)?;
            hits.push(EventHit {
                module: buf[0],
                channel: buf[1],
                charge_long: u16::from_le_bytes([buf[2], buf[3]]),
                charge_short: u16::from_le_bytes([buf[4], buf[5]]),
                time_ns: f64::from_le_bytes([
                    buf[6], buf[7], buf[8], buf[9], buf[10], buf[11], buf[12], buf[13],
                ]),
                with_ac: buf[14] != 0,
            });
        }
        Ok(Some(Event {
            trigger_time_ns,
            hits,
        }))
    }

    /// Read the next L2 record, whose snapshot lengths are dictated by the
    /// rule set that produced the file.
    pub fn next_event_with_snapshots(
        &mut self,
        n_counters: usize,
        n_flags: usize,
    ) -> Result<Option<(Event, Vec<u64>, Vec<bool>)>, EventFileError> {
        let Some(event) = self.next_event()? else {
            return Ok(None);
        };
        let mut counters = Vec::with_capacity(n_counters);
        for _ in 0..n_counters {
            let mut buf = [0u8; 8];
            self.fill(&mut buf)?;
            counters.push(u64::from_le_bytes(buf));
        }
        let mut flags = Vec::with_capacity(n_flags);
        for _ in 0..n_flags {
            let mut buf = [0u8; 1];
            self.fill(&mut buf)?;
            flags.push(buf[0] != 0);
        }
        Ok(Some((event, counters, flags)))
    }

    fn read_u32(&mut self) -> Result<u32, EventFileError> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Fill `buf` completely or fail as corrupt.
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), EventFileError> {
        if self.try_fill(buf)? {
            Ok(())
        } else {
            Err(EventFileError::Corrupt(format!(
                "{} ends in the middle of a record",
                self.path.display()
            )))
        }
    }

    /// Fill `buf` completely; `Ok(false)` means a clean end of file before
    /// the first byte. A partial read is corrupt.
    fn try_fill(&mut self, buf: &mut [u8]) -> Result<bool, EventFileError> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.reader.read(&mut buf[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(false);
                }
                return Err(EventFileError::Corrupt(format!(
                    "{} ends in the middle of a record",
                    self.path.display()
                )));
            }
            read += n;
        }
        self.consumed += buf.len() as u64;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_event() -> Event {
        Event {
            trigger_time_ns: 123.5,
            hits: vec![
                EventHit {
                    module: 0,
                    channel: 1,
                    charge_long: 500,
                    charge_short: 100,
                    time_ns: 0.0,
                    with_ac: false,
                },
                EventHit {
                    module: 2,
                    channel: 5,
                    charge_long: 900,
                    charge_short: 30,
                    time_ns: -42.25,
                    with_ac: true,
                },
            ],
        }
    }

    #[test]
    fn l1_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("L1_0.dat");

        let mut writer = EventWriter::create(&path).unwrap();
        writer.write_event(&sample_event()).unwrap();
        writer.write_event(&Event::new(999.0)).unwrap();
        writer.flush().unwrap();

        let mut reader = EventReader::open(&path).unwrap();
        assert_eq!(reader.next_event().unwrap().unwrap(), sample_event());
        let empty = reader.next_event().unwrap().unwrap();
        assert_eq!(empty.trigger_time_ns, 999.0);
        assert!(empty.hits.is_empty());
        assert!(reader.next_event().unwrap().is_none());
        assert_eq!(reader.progress(), 1.0);
    }

    #[test]
    fn l2_round_trip_with_snapshots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("L2_0.dat");

        let mut writer = EventWriter::create(&path).unwrap();
        writer
            .write_event_with_snapshots(&sample_event(), &[2, 0], &[true, false, true])
            .unwrap();
        writer.flush().unwrap();

        let mut reader = EventReader::open(&path).unwrap();
        let (event, counters, flags) = reader.next_event_with_snapshots(2, 3).unwrap().unwrap();
        assert_eq!(event, sample_event());
        assert_eq!(counters, vec![2, 0]);
        assert_eq!(flags, vec![true, false, true]);
        assert!(reader.next_event_with_snapshots(2, 3).unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("L1_0.dat");

        let mut writer = EventWriter::create(&path).unwrap();
        writer.write_event(&sample_event()).unwrap();
        writer.flush().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let mut reader = EventReader::open(&path).unwrap();
        assert!(matches!(
            reader.next_event(),
            Err(EventFileError::Corrupt(_))
        ));
    }
}
