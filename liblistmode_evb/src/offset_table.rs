use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use super::error::OffsetTableError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct OffsetEntry {
    #[serde(rename = "TimeOffset")]
    time_offset: f64,
}

/// Per-channel-pair time offsets in nanoseconds, indexed
/// `[ref_mod][ref_ch][mod][ch]`.
///
/// The table is produced once per run campaign by the time aligner and is
/// read-only afterwards; the L1 build consumes a single `(ref_mod, ref_ch)`
/// slice of it. The diagonal is forced to zero on both load and save.
#[derive(Debug, Clone, Default)]
pub struct OffsetTable {
    offsets: Vec<Vec<Vec<Vec<f64>>>>,
}

impl OffsetTable {
    /// Build a table from raw offsets, forcing the diagonal to zero.
    pub fn from_offsets(mut offsets: Vec<Vec<Vec<Vec<f64>>>>) -> Self {
        Self::zero_diagonal(&mut offsets);
        Self { offsets }
    }

    /// Load the 4-level `timeSettings.json` table.
    pub fn load(path: &Path) -> Result<Self, OffsetTableError> {
        if !path.exists() {
            return Err(OffsetTableError::BadFilePath(path.to_path_buf()));
        }
        let reader = BufReader::new(File::open(path)?);
        let entries: Vec<Vec<Vec<Vec<OffsetEntry>>>> = serde_json::from_reader(reader)?;
        if entries.is_empty() {
            return Err(OffsetTableError::Empty(path.to_path_buf()));
        }
        let mut offsets: Vec<Vec<Vec<Vec<f64>>>> = entries
            .into_iter()
            .map(|ref_mod| {
                ref_mod
                    .into_iter()
                    .map(|ref_ch| {
                        ref_ch
                            .into_iter()
                            .map(|module| module.into_iter().map(|e| e.time_offset).collect())
                            .collect()
                    })
                    .collect()
            })
            .collect();
        Self::zero_diagonal(&mut offsets);
        Ok(Self { offsets })
    }

    /// Write the table as 4-level nested arrays of `{"TimeOffset": ns}`.
    pub fn save(&self, path: &Path) -> Result<(), OffsetTableError> {
        let entries: Vec<Vec<Vec<Vec<OffsetEntry>>>> = self
            .offsets
            .iter()
            .map(|ref_mod| {
                ref_mod
                    .iter()
                    .map(|ref_ch| {
                        ref_ch
                            .iter()
                            .map(|module| {
                                module
                                    .iter()
                                    .map(|&time_offset| OffsetEntry { time_offset })
                                    .collect()
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect();
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &entries)?;
        Ok(())
    }

    /// The `[mod][ch]` offset slice for one reference channel, the only part
    /// of the table the L1 build consumes.
    pub fn slice(&self, ref_mod: u32, ref_ch: u32) -> Result<&Vec<Vec<f64>>, OffsetTableError> {
        self.offsets
            .get(ref_mod as usize)
            .and_then(|m| m.get(ref_ch as usize))
            .ok_or(OffsetTableError::ReferenceOutOfRange {
                module: ref_mod,
                channel: ref_ch,
                n_modules: self.offsets.len(),
            })
    }

    fn zero_diagonal(offsets: &mut [Vec<Vec<Vec<f64>>>]) {
        for (ref_mod, per_ch) in offsets.iter_mut().enumerate() {
            for (ref_ch, per_mod) in per_ch.iter_mut().enumerate() {
                if let Some(diag) = per_mod.get_mut(ref_mod).and_then(|m| m.get_mut(ref_ch)) {
                    *diag = 0.0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table_2x2(value: f64) -> Vec<Vec<Vec<Vec<f64>>>> {
        vec![vec![vec![vec![value; 2]; 2]; 2]; 2]
    }

    #[test]
    fn diagonal_is_forced_to_zero() {
        let table = OffsetTable::from_offsets(table_2x2(5.0));
        let slice = table.slice(1, 0).unwrap();
        assert_eq!(slice[1][0], 0.0);
        assert_eq!(slice[0][0], 5.0);
        assert_eq!(slice[0][1], 5.0);
        assert_eq!(slice[1][1], 5.0);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("timeSettings.json");

        let mut offsets = table_2x2(0.0);
        offsets[0][1][1][0] = -12.5;
        OffsetTable::from_offsets(offsets).save(&path).unwrap();

        let table = OffsetTable::load(&path).unwrap();
        assert_eq!(table.slice(0, 1).unwrap()[1][0], -12.5);
        assert_eq!(table.slice(0, 1).unwrap()[0][1], 0.0);
    }

    #[test]
    fn reference_out_of_range() {
        let table = OffsetTable::from_offsets(table_2x2(0.0));
        assert!(matches!(
            table.slice(2, 0),
            Err(OffsetTableError::ReferenceOutOfRange { module: 2, .. })
        ));
        assert!(matches!(
            table.slice(0, 5),
            Err(OffsetTableError::ReferenceOutOfRange { channel: 5, .. })
        ));
    }
}
