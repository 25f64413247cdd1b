//! Cache write-back: rows, extended per-column ranges, access time, and
//! negative-result timestamps. All writes go through one atomic batch.

use anyhow::Context;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::identity::{COL_ALERT, COL_REVISION};
use crate::range::Range;
use crate::request::CacheRequest;
use crate::rows::DataRow;
use crate::store::{
    SeriesStore, WriteBatch, META_ACCESS_TIME, META_IMPROVEMENT_DIRECTION,
    META_MISSING_TIMESTAMP, META_UNITS,
};

fn now_rfc3339() -> anyhow::Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("format access timestamp")
}

/// Persist the final merged result of one request.
///
/// Rows shallow-merge over whatever is already stored at the same revision.
/// The covered range `[request.min, last_row.revision]` extends every
/// requested column's availability except `revision` and `alert`, which are
/// never recorded as available. No rows means no range update.
pub fn write_back(
    store: &dyn SeriesStore,
    request: &CacheRequest,
    rows: &[DataRow],
    units: Option<Value>,
    improvement_direction: Option<Value>,
) -> anyhow::Result<()> {
    let mut batch = WriteBatch::default();
    batch.put_metadata(META_ACCESS_TIME, Value::String(now_rfc3339()?));
    if let Some(units) = units {
        batch.put_metadata(META_UNITS, units);
    }
    if let Some(direction) = improvement_direction {
        batch.put_metadata(META_IMPROVEMENT_DIRECTION, direction);
    }

    if let Some(last) = rows.last() {
        for row in rows {
            let mut stored = store
                .row(row.revision)?
                .unwrap_or_else(|| DataRow::new(row.revision));
            stored.merge_fields(row);
            batch.put_row(stored);
        }

        let covered = Range::new(
            request.min_revision.map_or(0.0, |min| min as f64),
            last.revision as f64,
        );
        for column in &request.columns {
            if column == COL_REVISION || column == COL_ALERT {
                continue;
            }
            let known = store.column_ranges(column)?;
            batch.put_ranges(column.clone(), covered.merge_into(&known));
        }
    }

    store.commit(batch)
}

/// Remember that the backend answered "not found" for this timeseries.
pub fn record_missing(store: &dyn SeriesStore) -> anyhow::Result<()> {
    let now = now_rfc3339()?;
    let mut batch = WriteBatch::default();
    batch.put_metadata(META_MISSING_TIMESTAMP, Value::String(now.clone()));
    batch.put_metadata(META_ACCESS_TIME, Value::String(now));
    store.commit(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TimeseriesIdentity;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn request(min: Option<u64>, max: Option<u64>, columns: &[&str]) -> CacheRequest {
        CacheRequest {
            identity: TimeseriesIdentity::new("suite", "metric", "bot7", "", "").unwrap(),
            statistic: "avg".to_owned(),
            columns: columns.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
            min_revision: min,
            max_revision: max,
        }
    }

    fn rows(revisions: &[u64]) -> Vec<DataRow> {
        revisions
            .iter()
            .map(|revision| DataRow::new(*revision).with_field("avg", *revision as f64))
            .collect()
    }

    #[test]
    fn ranges_extend_to_the_last_written_row() {
        let store = MemoryStore::new();
        write_back(
            &store,
            &request(Some(0), Some(100), &["revision", "avg"]),
            &rows(&[10, 50, 90]),
            Some(json!("ms")),
            None,
        )
        .unwrap();

        assert_eq!(store.column_ranges("avg").unwrap(), vec![Range::new(0.0, 90.0)]);
        assert_eq!(store.metadata(META_UNITS).unwrap(), Some(json!("ms")));
        assert!(store.metadata(META_ACCESS_TIME).unwrap().is_some());
    }

    #[test]
    fn alert_and_revision_never_gain_availability() {
        let store = MemoryStore::new();
        write_back(
            &store,
            &request(Some(0), Some(100), &["revision", "avg", "alert"]),
            &rows(&[10, 20]),
            None,
            None,
        )
        .unwrap();

        assert!(!store.column_ranges("avg").unwrap().is_empty());
        assert!(store.column_ranges("alert").unwrap().is_empty());
        assert!(store.column_ranges("revision").unwrap().is_empty());
    }

    #[test]
    fn rows_merge_over_existing_fields() {
        let store = MemoryStore::new();
        write_back(
            &store,
            &request(Some(0), Some(100), &["revision", "avg"]),
            &rows(&[10]),
            None,
            None,
        )
        .unwrap();

        let update = vec![DataRow::new(10).with_field("count", 4)];
        write_back(
            &store,
            &request(Some(0), Some(100), &["revision", "count"]),
            &update,
            None,
            None,
        )
        .unwrap();

        let row = store.row(10).unwrap().unwrap();
        assert_eq!(row.fields["avg"], json!(10.0));
        assert_eq!(row.fields["count"], json!(4));
    }

    #[test]
    fn successive_writes_coalesce_ranges() {
        let store = MemoryStore::new();
        let req = request(Some(0), Some(100), &["revision", "avg"]);
        write_back(&store, &req, &rows(&[10, 100]), None, None).unwrap();
        let wider = request(Some(100), Some(200), &["revision", "avg"]);
        write_back(&store, &wider, &rows(&[150, 200]), None, None).unwrap();

        assert_eq!(
            store.column_ranges("avg").unwrap(),
            vec![Range::new(0.0, 200.0)]
        );
    }

    #[test]
    fn record_missing_stamps_metadata() {
        let store = MemoryStore::new();
        record_missing(&store).unwrap();
        let stamp = store.metadata(META_MISSING_TIMESTAMP).unwrap().unwrap();
        assert!(OffsetDateTime::parse(stamp.as_str().unwrap(), &Rfc3339).is_ok());
    }
}
