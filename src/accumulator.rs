//! Memory-bounded accumulation of large record streams.
//!
//! Records are held in memory until their estimated footprint would cross the
//! ceiling. At that point every held record is written to a spill file (one
//! JSON document per line) and all later records go straight to the file.
//! Running statistics and a reservoir sample cover every record ever added,
//! spilled or not.

use crate::error::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Fixed bookkeeping cost charged per record on top of its own estimate
const RECORD_OVERHEAD: usize = 64;

/// A record the accumulator can size, summarize, and spill
pub trait Record: Serialize + DeserializeOwned + Clone {
    /// Conservative estimate of the heap footprint, in bytes
    fn estimated_size(&self) -> usize;

    /// Report numeric fields for the running statistics
    fn visit_numeric(&self, _visit: &mut dyn FnMut(&str, f64)) {}
}

impl Record for serde_json::Value {
    fn estimated_size(&self) -> usize {
        json_size(self)
    }

    fn visit_numeric(&self, visit: &mut dyn FnMut(&str, f64)) {
        if let serde_json::Value::Object(map) = self {
            for (key, value) in map {
                if let Some(n) = value.as_f64() {
                    visit(key, n);
                }
            }
        }
    }
}

fn json_size(value: &serde_json::Value) -> usize {
    use serde_json::Value;
    match value {
        Value::Null | Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => 24 + s.len(),
        Value::Array(items) => 24 + items.iter().map(json_size).sum::<usize>(),
        Value::Object(map) => {
            48 + map
                .iter()
                .map(|(k, v)| 24 + k.len() + json_size(v))
                .sum::<usize>()
        }
    }
}

/// Running statistics for one numeric field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl FieldStats {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            min: value,
            max: value,
            sum: value,
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

pub struct ResultAccumulator<T: Record> {
    memory_ceiling: usize,
    sample_size: usize,
    spill_dir: PathBuf,
    record_cap: Option<usize>,
    records: Vec<T>,
    estimated_bytes: usize,
    spill: Option<BufWriter<NamedTempFile>>,
    stored: usize,
    capped: bool,
    sample: Vec<T>,
    stats: BTreeMap<String, FieldStats>,
    total: u64,
    rng: StdRng,
}

impl<T: Record> ResultAccumulator<T> {
    pub fn new(memory_ceiling: usize, sample_size: usize, spill_dir: impl Into<PathBuf>) -> Self {
        Self::with_rng(memory_ceiling, sample_size, spill_dir, StdRng::from_os_rng())
    }

    /// Deterministic sampling, for reproducible tests
    pub fn with_seed(
        memory_ceiling: usize,
        sample_size: usize,
        spill_dir: impl Into<PathBuf>,
        seed: u64,
    ) -> Self {
        Self::with_rng(memory_ceiling, sample_size, spill_dir, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        memory_ceiling: usize,
        sample_size: usize,
        spill_dir: impl Into<PathBuf>,
        rng: StdRng,
    ) -> Self {
        Self {
            memory_ceiling,
            sample_size,
            spill_dir: spill_dir.into(),
            record_cap: None,
            records: Vec::new(),
            estimated_bytes: 0,
            spill: None,
            stored: 0,
            capped: false,
            sample: Vec::with_capacity(sample_size.min(1024)),
            stats: BTreeMap::new(),
            total: 0,
            rng,
        }
    }

    /// Keep at most `cap` records; later ones still count toward statistics and the sample
    pub fn with_record_cap(mut self, cap: Option<usize>) -> Self {
        self.record_cap = cap;
        self
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// True once the record cap has dropped at least one record
    pub fn is_capped(&self) -> bool {
        self.capped
    }

    /// Bytes currently charged against the memory ceiling
    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub fn add(&mut self, record: T) -> Result<()> {
        self.total += 1;

        let stats = &mut self.stats;
        record.visit_numeric(&mut |name, value| match stats.get_mut(name) {
            Some(field) => field.observe(value),
            None => {
                stats.insert(name.to_string(), FieldStats::new(value));
            }
        });

        self.sample_record(&record);

        if let Some(cap) = self.record_cap {
            if self.stored >= cap {
                self.capped = true;
                return Ok(());
            }
        }
        self.stored += 1;

        if let Some(writer) = self.spill.as_mut() {
            return write_record(writer, &record);
        }

        let size = record.estimated_size() + RECORD_OVERHEAD;
        if self.estimated_bytes + size > self.memory_ceiling {
            self.spill_to_disk()?;
            if let Some(writer) = self.spill.as_mut() {
                write_record(writer, &record)?;
            }
        } else {
            self.records.push(record);
            self.estimated_bytes += size;
        }
        Ok(())
    }

    /// Reservoir sampling over the k-th record (1-indexed)
    fn sample_record(&mut self, record: &T) {
        let k = self.total;
        if k <= self.sample_size as u64 {
            self.sample.push(record.clone());
        } else {
            let r = self.rng.random_range(0..k);
            if r < self.sample_size as u64 {
                self.sample[r as usize] = record.clone();
            }
        }
    }

    fn spill_to_disk(&mut self) -> Result<()> {
        let file = NamedTempFile::with_prefix_in("xcoffscan-spill-", &self.spill_dir).map_err(|e| {
            Error::storage(format!(
                "cannot create spill file in {}: {}",
                self.spill_dir.display(),
                e
            ))
        })?;
        let mut writer = BufWriter::new(file);
        let held = self.records.len();
        for record in self.records.drain(..) {
            write_record(&mut writer, &record)?;
        }
        debug!(
            spilled_records = held,
            estimated_bytes = self.estimated_bytes,
            ceiling = self.memory_ceiling,
            "Memory ceiling reached, spilling to disk"
        );
        self.records.shrink_to_fit();
        self.estimated_bytes = 0;
        self.spill = Some(writer);
        Ok(())
    }

    pub fn finish(self) -> Result<AccumulatorResult<T>> {
        let spill = match self.spill {
            Some(writer) => {
                let file = writer
                    .into_inner()
                    .map_err(|e| Error::storage(format!("cannot flush spill file: {}", e.error())))?;
                Some(SpillFile {
                    file,
                    records: self.stored,
                    _marker: PhantomData,
                })
            }
            None => None,
        };
        let records = if spill.is_none() {
            Some(self.records)
        } else {
            None
        };

        Ok(AccumulatorResult {
            total_count: self.total,
            stats: self.stats,
            sample: self.sample,
            records,
            spill,
            capped: self.capped,
        })
    }
}

fn write_record<T: Serialize, W: Write>(writer: &mut W, record: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, record)
        .map_err(|e| Error::storage(format!("spill write failed: {}", e)))?;
    writer
        .write_all(b"\n")
        .map_err(|e| Error::storage(format!("spill write failed: {}", e)))
}

/// Output of a finished accumulation
#[derive(Debug)]
pub struct AccumulatorResult<T: Record> {
    pub total_count: u64,
    pub stats: BTreeMap<String, FieldStats>,
    pub sample: Vec<T>,
    /// Every kept record, only when the ceiling was never crossed
    pub records: Option<Vec<T>>,
    /// Overflow storage, only when the ceiling was crossed
    pub spill: Option<SpillFile<T>>,
    /// True when the record cap dropped records from storage
    pub capped: bool,
}

impl<T: Record> AccumulatorResult<T> {
    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// Delete any spill file now instead of at drop time
    pub fn release(self) -> Result<()> {
        match self.spill {
            Some(spill) => spill.release(),
            None => Ok(()),
        }
    }
}

/// Temporary file holding spilled records; removed on `release` or drop
#[derive(Debug)]
pub struct SpillFile<T> {
    file: NamedTempFile,
    records: usize,
    _marker: PhantomData<T>,
}

impl<T: Record> SpillFile<T> {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Stream the spilled records back in insertion order
    pub fn records(&self) -> Result<SpillReader<T>> {
        let file = self.file.reopen()?;
        Ok(SpillReader {
            reader: BufReader::new(file),
            line: String::new(),
            _marker: PhantomData,
        })
    }

    pub fn release(self) -> Result<()> {
        self.file
            .close()
            .map_err(|e| Error::storage(format!("cannot remove spill file: {}", e)))
    }
}

pub struct SpillReader<T> {
    reader: BufReader<File>,
    line: String,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> Iterator for SpillReader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => None,
            Ok(_) => Some(serde_json::from_str(self.line.trim_end()).map_err(Error::from)),
            Err(e) => Some(Err(Error::from(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn symbol(i: u64) -> serde_json::Value {
        json!({"name": format!("sym_{:05}", i), "value": i * 16})
    }

    #[test]
    fn test_under_ceiling_keeps_records_in_memory() {
        let dir = TempDir::new().unwrap();
        let mut acc = ResultAccumulator::with_seed(1 << 20, 10, dir.path(), 7);
        for i in 0..50 {
            acc.add(symbol(i)).unwrap();
        }
        let result = acc.finish().unwrap();

        assert_eq!(result.total_count, 50);
        assert!(!result.is_spilled());
        assert_eq!(result.records.as_ref().map(Vec::len), Some(50));
        assert_eq!(result.sample.len(), 10);
    }

    #[test]
    fn test_sample_size_and_count_after_many_records() {
        let dir = TempDir::new().unwrap();
        let mut acc = ResultAccumulator::with_seed(1 << 20, 25, dir.path(), 42);
        for i in 0..1000 {
            acc.add(symbol(i)).unwrap();
        }
        let result = acc.finish().unwrap();
        assert_eq!(result.total_count, 1000);
        assert_eq!(result.sample.len(), 25);
    }

    #[test]
    fn test_sample_keeps_everything_when_stream_is_short() {
        let dir = TempDir::new().unwrap();
        let mut acc = ResultAccumulator::with_seed(1 << 20, 25, dir.path(), 1);
        for i in 0..5 {
            acc.add(symbol(i)).unwrap();
        }
        let result = acc.finish().unwrap();
        assert_eq!(result.sample, (0..5).map(symbol).collect::<Vec<_>>());
    }

    #[test]
    fn test_statistics_cover_all_records() {
        let dir = TempDir::new().unwrap();
        let mut acc = ResultAccumulator::with_seed(512, 4, dir.path(), 3);
        for i in 1..=100 {
            acc.add(symbol(i)).unwrap();
        }
        let result = acc.finish().unwrap();
        let stats = result.stats["value"];
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 16.0);
        assert_eq!(stats.max, 1600.0);
        assert_eq!(stats.sum, 16.0 * 5050.0);
        assert!(!result.stats.contains_key("name"));
    }

    #[test]
    fn test_spill_moves_everything_to_disk() {
        let dir = TempDir::new().unwrap();
        let mut acc = ResultAccumulator::with_seed(1024, 5, dir.path(), 9);
        for i in 0..200 {
            acc.add(symbol(i)).unwrap();
            assert!(acc.estimated_bytes() <= 1024);
        }
        assert!(acc.is_spilled());
        let result = acc.finish().unwrap();

        assert!(result.records.is_none());
        let spill = result.spill.as_ref().unwrap();
        assert_eq!(spill.record_count(), 200);

        let read_back: Vec<serde_json::Value> =
            spill.records().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(read_back, (0..200).map(symbol).collect::<Vec<_>>());
    }

    #[test]
    fn test_spill_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let mut acc = ResultAccumulator::with_seed(300, 5, dir.path(), 9);
        acc.add(symbol(0)).unwrap();
        acc.add(symbol(1)).unwrap();
        acc.add(symbol(2)).unwrap();
        assert!(acc.is_spilled());
        assert_eq!(acc.estimated_bytes(), 0);

        // A tiny record would fit now, but the accumulator never un-spills
        acc.add(json!(null)).unwrap();
        assert!(acc.is_spilled());
        assert_eq!(acc.estimated_bytes(), 0);
    }

    #[test]
    fn test_release_deletes_spill_file() {
        let dir = TempDir::new().unwrap();
        let mut acc = ResultAccumulator::with_seed(128, 5, dir.path(), 9);
        for i in 0..20 {
            acc.add(symbol(i)).unwrap();
        }
        let result = acc.finish().unwrap();
        let path = result.spill.as_ref().unwrap().path().to_path_buf();
        assert!(path.exists());

        result.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_record_cap_limits_storage_not_count() {
        let dir = TempDir::new().unwrap();
        let mut acc =
            ResultAccumulator::with_seed(1 << 20, 5, dir.path(), 2).with_record_cap(Some(10));
        for i in 0..30 {
            acc.add(symbol(i)).unwrap();
        }
        assert!(acc.is_capped());
        let result = acc.finish().unwrap();
        assert_eq!(result.total_count, 30);
        assert!(result.capped);
        assert_eq!(result.records.unwrap().len(), 10);
        assert_eq!(result.stats["value"].count, 30);
    }

    #[test]
    fn test_spill_dir_failure_is_storage_error() {
        let mut acc = ResultAccumulator::with_seed(1, 5, "/nonexistent/spill/dir", 2);
        let err = acc.add(symbol(1)).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }
}
