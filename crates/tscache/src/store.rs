//! Persistent per-timeseries storage.
//!
//! This module provides the `SeriesStore` abstraction, two implementations
//! (`MemoryStore` in-memory and the fjall-backed `StoreCatalog` /
//! `FjallSeriesStore` on disk), and the atomic `WriteBatch` applied by the
//! cache writer.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use serde_json::Value;

use crate::identity::TimeseriesIdentity;
use crate::range::Range;
use crate::rows::DataRow;

/// Metadata key: preferred direction of change for the measurement.
pub const META_IMPROVEMENT_DIRECTION: &str = "improvement_direction";
/// Metadata key: measurement units.
pub const META_UNITS: &str = "units";
/// Metadata key: RFC 3339 timestamp of the last remote "not found".
pub const META_MISSING_TIMESTAMP: &str = "missingTimestamp";
/// Metadata key: RFC 3339 timestamp of the last write. Written for external
/// evictors; never consulted here.
pub const META_ACCESS_TIME: &str = "_accessTime";

/// Current layout version, recorded once per keyspace.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_VERSION_KEY: &[u8] = b"__schema_version";

/// Pending writes applied atomically by `SeriesStore::commit`.
///
/// Rows carry their final field values; read-modify-write merging happens
/// in the cache writer before the batch is built.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) rows: Vec<DataRow>,
    pub(crate) metadata: Vec<(String, Value)>,
    pub(crate) ranges: Vec<(String, Vec<Range>)>,
}

impl WriteBatch {
    pub fn put_row(&mut self, row: DataRow) {
        self.rows.push(row);
    }

    pub fn put_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.push((key.into(), value));
    }

    pub fn put_ranges(&mut self, column: impl Into<String>, ranges: Vec<Range>) {
        self.ranges.push((column.into(), ranges));
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.metadata.is_empty() && self.ranges.is_empty()
    }
}

/// Storage for one timeseries identity: rows keyed by revision, string-keyed
/// metadata, and per-column available-range lists.
pub trait SeriesStore: Send + Sync {
    /// Rows with revisions inside the inclusive `range`, ascending; all
    /// rows when `range` is `None`.
    fn rows_in(&self, range: Option<&Range>) -> anyhow::Result<Vec<DataRow>>;
    /// The row stored at exactly `revision`, if any.
    fn row(&self, revision: u64) -> anyhow::Result<Option<DataRow>>;
    fn metadata(&self, key: &str) -> anyhow::Result<Option<Value>>;
    /// Stored available ranges for `column`, sorted by min, disjoint.
    fn column_ranges(&self, column: &str) -> anyhow::Result<Vec<Range>>;
    /// Apply all writes in `batch` atomically.
    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()>;
}

/// Hands out the per-identity store for a request.
pub trait SeriesStoreProvider: Send + Sync {
    fn series(&self, identity: &TimeseriesIdentity) -> anyhow::Result<Arc<dyn SeriesStore>>;
}

/// Clip an f64 interval to inclusive u64 revision bounds.
pub(crate) fn revision_bounds(range: &Range) -> (u64, u64) {
    let lo = if range.min() <= 0.0 {
        0
    } else {
        range.min().ceil() as u64
    };
    let hi = if range.max() >= u64::MAX as f64 {
        u64::MAX
    } else {
        range.max().floor() as u64
    };
    (lo, hi)
}

#[derive(Debug, Default)]
struct MemoryInner {
    rows: BTreeMap<u64, DataRow>,
    metadata: HashMap<String, Value>,
    ranges: HashMap<String, Vec<Range>>,
}

/// In-memory store used by tests and by hosts that do not persist.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeriesStore for MemoryStore {
    fn rows_in(&self, range: Option<&Range>) -> anyhow::Result<Vec<DataRow>> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let rows = match range {
            None => inner.rows.values().cloned().collect(),
            Some(range) if range.is_empty() => Vec::new(),
            Some(range) => {
                let (lo, hi) = revision_bounds(range);
                // A fractional range can clip to an empty integer interval.
                if lo > hi {
                    Vec::new()
                } else {
                    inner.rows.range(lo..=hi).map(|(_, row)| row.clone()).collect()
                }
            }
        };
        Ok(rows)
    }

    fn row(&self, revision: u64) -> anyhow::Result<Option<DataRow>> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(inner.rows.get(&revision).cloned())
    }

    fn metadata(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(inner.metadata.get(key).cloned())
    }

    fn column_ranges(&self, column: &str) -> anyhow::Result<Vec<Range>> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(inner.ranges.get(column).cloned().unwrap_or_default())
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        for row in batch.rows {
            inner.rows.insert(row.revision, row);
        }
        for (key, value) in batch.metadata {
            inner.metadata.insert(key, value);
        }
        for (column, ranges) in batch.ranges {
            inner.ranges.insert(column, ranges);
        }
        Ok(())
    }
}

/// `SeriesStoreProvider` over shared in-memory stores, one per identity.
#[derive(Default)]
pub struct MemoryProvider {
    stores: RwLock<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeriesStoreProvider for MemoryProvider {
    fn series(&self, identity: &TimeseriesIdentity) -> anyhow::Result<Arc<dyn SeriesStore>> {
        let name = identity.store_name();
        let mut stores = self.stores.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let store = stores.entry(name).or_insert_with(|| Arc::new(MemoryStore::new()));
        Ok(store.clone())
    }
}

/// Fjall-backed storage shared by every identity in the process.
///
/// The keyspace holds three partitions (`data`, `metadata`, `ranges`).
/// Identity scoping lives in a length-prefixed key prefix rather than in
/// partition names, which cannot carry the `/`-separated store name.
#[derive(Clone)]
pub struct StoreCatalog {
    keyspace: Arc<Keyspace>,
    data: PartitionHandle,
    metadata: PartitionHandle,
    ranges: PartitionHandle,
}

impl StoreCatalog {
    /// Open (or create) the keyspace under `dir` and record the schema
    /// version on first use.
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = Arc::new(
            fjall::Config::new(dir.as_ref())
                .open()
                .context("open fjall keyspace")?,
        );
        let data = keyspace.open_partition("data", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;
        let ranges = keyspace.open_partition("ranges", PartitionCreateOptions::default())?;
        if metadata.get(SCHEMA_VERSION_KEY)?.is_none() {
            metadata.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_be_bytes())?;
        }
        Ok(Self {
            keyspace,
            data,
            metadata,
            ranges,
        })
    }

    /// The store handle for one identity.
    pub fn series(&self, identity: &TimeseriesIdentity) -> FjallSeriesStore {
        FjallSeriesStore {
            catalog: self.clone(),
            prefix: encode_name_prefix(&identity.store_name()),
        }
    }
}

impl SeriesStoreProvider for StoreCatalog {
    fn series(&self, identity: &TimeseriesIdentity) -> anyhow::Result<Arc<dyn SeriesStore>> {
        Ok(Arc::new(StoreCatalog::series(self, identity)))
    }
}

/// One identity's view of the shared fjall partitions.
pub struct FjallSeriesStore {
    catalog: StoreCatalog,
    prefix: Vec<u8>,
}

/// Length-prefix the store name so no identity's keys can shadow another's.
fn encode_name_prefix(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

fn data_key(prefix: &[u8], revision: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 8);
    out.extend_from_slice(prefix);
    out.extend_from_slice(&revision.to_be_bytes());
    out
}

fn member_key(prefix: &[u8], member: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + member.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(member.as_bytes());
    out
}

fn decode_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(bytes).context("decode stored value")
}

impl SeriesStore for FjallSeriesStore {
    fn rows_in(&self, range: Option<&Range>) -> anyhow::Result<Vec<DataRow>> {
        let iter: Box<dyn Iterator<Item = fjall::Result<fjall::KvPair>>> = match range {
            None => Box::new(self.catalog.data.prefix(self.prefix.clone())),
            Some(range) if range.is_empty() => return Ok(Vec::new()),
            Some(range) => {
                let (lo, hi) = revision_bounds(range);
                // A fractional range can clip to an empty integer interval.
                if lo > hi {
                    return Ok(Vec::new());
                }
                Box::new(
                    self.catalog
                        .data
                        .range(data_key(&self.prefix, lo)..=data_key(&self.prefix, hi)),
                )
            }
        };
        let mut rows = Vec::new();
        for pair in iter {
            let (_, value) = pair?;
            rows.push(decode_json(&value)?);
        }
        Ok(rows)
    }

    fn row(&self, revision: u64) -> anyhow::Result<Option<DataRow>> {
        match self.catalog.data.get(data_key(&self.prefix, revision))? {
            Some(value) => Ok(Some(decode_json(&value)?)),
            None => Ok(None),
        }
    }

    fn metadata(&self, key: &str) -> anyhow::Result<Option<Value>> {
        match self.catalog.metadata.get(member_key(&self.prefix, key))? {
            Some(value) => Ok(Some(decode_json(&value)?)),
            None => Ok(None),
        }
    }

    fn column_ranges(&self, column: &str) -> anyhow::Result<Vec<Range>> {
        match self.catalog.ranges.get(member_key(&self.prefix, column))? {
            Some(value) => decode_json(&value),
            None => Ok(Vec::new()),
        }
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        let mut fjall_batch = self.catalog.keyspace.batch();
        for row in &batch.rows {
            fjall_batch.insert(
                &self.catalog.data,
                data_key(&self.prefix, row.revision),
                serde_json::to_vec(row)?,
            );
        }
        for (key, value) in &batch.metadata {
            fjall_batch.insert(
                &self.catalog.metadata,
                member_key(&self.prefix, key),
                serde_json::to_vec(value)?,
            );
        }
        for (column, ranges) in &batch.ranges {
            fjall_batch.insert(
                &self.catalog.ranges,
                member_key(&self.prefix, column),
                serde_json::to_vec(ranges)?,
            );
        }
        fjall_batch.commit().context("commit series batch")?;
        Ok(())
    }
}
