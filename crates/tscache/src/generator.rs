//! The result generator: an ordered stream of snapshots for one request.
//!
//! The cached snapshot is always first. Slice snapshots follow in remote
//! completion order, each carrying the full merged view so far. Completed
//! streams schedule a write-back; abandoned consumers cancel nothing, so
//! the cache still warms when the caller has gone away.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::identity::COL_ALERT;
use crate::planner::plan_slices;
use crate::reader::read_cache;
use crate::registry::{self, LiveRequest};
use crate::request::CacheRequest;
use crate::rows::{merge_rows, DataRow};
use crate::slice::{DataSlice, SliceOutcome, STATUS_NOT_FOUND};
use crate::store::SeriesStore;
use crate::transport::Transport;
use crate::writer;

/// How long a recorded "not found" suppresses re-fetching (2.8 days).
pub const MISSING_RETRY_WINDOW: time::Duration = time::Duration::seconds(241_920);

/// A request produces a handful of snapshots; the channel never grows past
/// the slice count plus one.
const SNAPSHOT_CHANNEL_DEPTH: usize = 16;

/// One consistent view pushed to the consumer.
#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improvement_direction: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<DataRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// Drives one request: cache read, planning, coalescing, slice fetches,
/// incremental merge, and the final write-back.
pub struct ResultGenerator {
    request: CacheRequest,
    store: Arc<dyn SeriesStore>,
    transport: Arc<dyn Transport>,
    url: String,
}

impl ResultGenerator {
    pub fn new(
        request: CacheRequest,
        store: Arc<dyn SeriesStore>,
        transport: Arc<dyn Transport>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            request,
            store,
            transport,
            url: url.into(),
        }
    }

    /// Spawn the generator and hand back the snapshot stream.
    pub fn stream(self) -> mpsc::Receiver<Snapshot> {
        let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_DEPTH);
        tokio::spawn(async move {
            if let Err(err) = self.run(tx).await {
                tracing::warn!(error = ?err, "timeseries read failed");
            }
        });
        rx
    }

    async fn run(self, tx: mpsc::Sender<Snapshot>) -> anyhow::Result<()> {
        let range = self.request.revision_range();
        let store_name = self.request.identity.store_name();
        let cached = read_cache(self.store.as_ref(), &self.request)?;

        let mut merged = cached.data.clone().unwrap_or_default();
        let mut units = cached.units.clone();
        let mut improvement_direction = cached.improvement_direction.clone();
        let mut columns: BTreeSet<String> = BTreeSet::new();

        // Send failures mean the consumer went away; keep going regardless.
        let _ = tx
            .send(Snapshot {
                improvement_direction: improvement_direction.clone(),
                units: units.clone(),
                columns: Vec::new(),
                data: cached.data,
                error: None,
                status: None,
            })
            .await;

        if let Some(timestamp) = &cached.missing_timestamp {
            if missing_is_fresh(timestamp) {
                tracing::debug!(
                    store = %store_name,
                    missing_since = %timestamp,
                    "suppressing fetch for recently missing timeseries"
                );
                return Ok(());
            }
        }

        let planned = plan_slices(&self.request.columns, &range, &cached.available_by_col);
        let coalesced = registry::coalesce(&store_name, planned);
        let own: Vec<Arc<DataSlice>> = coalesced
            .own
            .into_iter()
            .map(|spec| {
                Arc::new(DataSlice::new(
                    self.request.identity.clone(),
                    self.request.statistic.clone(),
                    spec,
                    self.url.clone(),
                    self.transport.clone(),
                ))
            })
            .collect();

        let live = Arc::new(LiveRequest {
            store_name,
            slices: own.clone(),
        });
        registry::register(&live);

        let mut pending = FuturesUnordered::new();
        for slice in own.iter().chain(coalesced.borrowed.iter()).cloned() {
            pending.push(async move { slice.outcome().await.clone() });
        }

        while let Some(outcome) = pending.next().await {
            match outcome {
                SliceOutcome::Error {
                    status: STATUS_NOT_FOUND,
                    ..
                } => {
                    // Negative result: remember it, emit nothing.
                    let store = self.store.clone();
                    tokio::spawn(async move {
                        if let Err(err) = writer::record_missing(store.as_ref()) {
                            tracing::warn!(error = ?err, "failed to record missing timeseries");
                        }
                    });
                }
                SliceOutcome::Error { message, status: 0 } => {
                    tracing::warn!(error = %message, "timeseries slice transport failed");
                }
                SliceOutcome::Error { message, status } => {
                    let _ = tx
                        .send(Snapshot {
                            improvement_direction: improvement_direction.clone(),
                            units: units.clone(),
                            columns: columns.iter().cloned().collect(),
                            data: Some(merged.clone()),
                            error: Some(message),
                            status: Some(status),
                        })
                        .await;
                }
                SliceOutcome::Rows {
                    columns: response_columns,
                    rows,
                    units: response_units,
                    improvement_direction: response_direction,
                } => {
                    // Alerts may have been nudged server-side; clear the
                    // stale field inside the request range before merging.
                    if response_columns.iter().any(|column| column == COL_ALERT) {
                        for row in merged
                            .iter_mut()
                            .filter(|row| range.contains(row.revision as f64))
                        {
                            row.fields.remove(COL_ALERT);
                        }
                    }
                    columns.extend(response_columns);
                    if let Some(value) = response_units {
                        units = Some(value);
                    }
                    if let Some(value) = response_direction {
                        improvement_direction = Some(value);
                    }
                    let rows: Vec<DataRow> = rows
                        .into_iter()
                        .filter(|row| range.contains(row.revision as f64))
                        .collect();
                    merge_rows(&mut merged, &rows);
                    let _ = tx
                        .send(Snapshot {
                            improvement_direction: improvement_direction.clone(),
                            units: units.clone(),
                            columns: columns.iter().cloned().collect(),
                            data: Some(merged.clone()),
                            error: None,
                            status: None,
                        })
                        .await;
                }
            }
        }
        registry::deregister(&live);

        if !merged.is_empty() {
            let store = self.store.clone();
            let request = self.request.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    writer::write_back(store.as_ref(), &request, &merged, units, improvement_direction)
                {
                    tracing::warn!(error = ?err, "timeseries write-back failed");
                }
            });
        }
        Ok(())
    }
}

/// True when `timestamp` parses and is younger than the retry window.
fn missing_is_fresh(timestamp: &str) -> bool {
    match OffsetDateTime::parse(timestamp, &Rfc3339) {
        Ok(recorded) => OffsetDateTime::now_utc() - recorded < MISSING_RETRY_WINDOW,
        // Unparseable timestamps are treated as absent.
        Err(_) => false,
    }
}
