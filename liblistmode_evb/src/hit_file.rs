use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::error::HitFileError;
use super::hit::{RawHit, RAW_HIT_SIZE};

/// Reader over one binary list-mode hit file.
///
/// A file is a bare little-endian sequence of `RawHit` records; the entry
/// count is derived from the file length. Reads are addressed by entry index
/// so that files with hundreds of millions of hits can be consumed in chunks
/// of bounded size.
#[derive(Debug)]
pub struct HitFile {
    reader: BufReader<File>,
    n_entries: u64,
    size_bytes: u64,
    path: PathBuf,
}

impl HitFile {
    pub fn open(path: &Path) -> Result<Self, HitFileError> {
        if !path.exists() {
            return Err(HitFileError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let size_bytes = file.metadata()?.len();
        if size_bytes % RAW_HIT_SIZE as u64 != 0 {
            log::warn!(
                "Hit file {} has {} trailing bytes; ignoring the partial record",
                path.display(),
                size_bytes % RAW_HIT_SIZE as u64
            );
        }
        Ok(Self {
            reader: BufReader::new(file),
            n_entries: size_bytes / RAW_HIT_SIZE as u64,
            size_bytes,
            path: path.to_path_buf(),
        })
    }

    pub fn n_entries(&self) -> u64 {
        self.n_entries
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one record by entry index.
    pub fn read_entry(&mut self, index: u64) -> Result<RawHit, HitFileError> {
        self.reader
            .seek(SeekFrom::Start(index * RAW_HIT_SIZE as u64))?;
        let mut buf = [0u8; RAW_HIT_SIZE];
        self.reader.read_exact(&mut buf)?;
        Ok(RawHit::from_le_bytes(&buf))
    }

    /// Read the half-open entry range `[start, end)`.
    pub fn read_range(&mut self, start: u64, end: u64) -> Result<Vec<RawHit>, HitFileError> {
        debug_assert!(start <= end && end <= self.n_entries);
        let n = (end - start) as usize;
        self.reader
            .seek(SeekFrom::Start(start * RAW_HIT_SIZE as u64))?;
        let mut bytes = vec![0u8; n * RAW_HIT_SIZE];
        self.reader.read_exact(&mut bytes)?;

        let mut hits = Vec::with_capacity(n);
        for record in bytes.chunks_exact(RAW_HIT_SIZE) {
            let mut buf = [0u8; RAW_HIT_SIZE];
            buf.copy_from_slice(record);
            hits.push(RawHit::from_le_bytes(&buf));
        }
        Ok(hits)
    }
}

/// Writer producing list-mode hit files, used by the test fixtures and the
/// simulation tooling.
#[derive(Debug)]
pub struct HitFileWriter {
    writer: BufWriter<File>,
}

impl HitFileWriter {
    pub fn create(path: &Path) -> Result<Self, HitFileError> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    pub fn write(&mut self, hit: &RawHit) -> Result<(), HitFileError> {
        self.writer.write_all(&hit.to_le_bytes())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), HitFileError> {
        self.writer.flush()?;
        Ok(())
    }
}
