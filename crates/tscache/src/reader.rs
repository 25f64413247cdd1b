//! Cache read path: rows, metadata, and per-column availability clipped to
//! one request.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::identity::COL_REVISION;
use crate::range::Range;
use crate::request::CacheRequest;
use crate::rows::DataRow;
use crate::store::{
    SeriesStore, META_IMPROVEMENT_DIRECTION, META_MISSING_TIMESTAMP, META_UNITS,
};

/// Everything the generator needs from the local store for one request.
#[derive(Debug, Default)]
pub struct CachedRead {
    pub improvement_direction: Option<Value>,
    pub units: Option<Value>,
    pub missing_timestamp: Option<String>,
    /// Per requested column, the first stored range overlapping the request,
    /// clipped to the request. Columns with no overlap are absent.
    pub available_by_col: BTreeMap<String, Range>,
    /// Cached rows, present only when some column overlaps the request.
    pub data: Option<Vec<DataRow>>,
}

pub fn read_cache(store: &dyn SeriesStore, request: &CacheRequest) -> anyhow::Result<CachedRead> {
    let range = request.revision_range();
    // An entirely unbounded request reads every stored row.
    let rows = if request.min_revision.is_none() && request.max_revision.is_none() {
        store.rows_in(None)?
    } else {
        store.rows_in(Some(&range))?
    };

    let improvement_direction = store.metadata(META_IMPROVEMENT_DIRECTION)?;
    let units = store.metadata(META_UNITS)?;
    let missing_timestamp = store
        .metadata(META_MISSING_TIMESTAMP)?
        .and_then(|value| value.as_str().map(str::to_owned));

    let mut available_by_col = BTreeMap::new();
    for column in &request.columns {
        if column == COL_REVISION {
            continue;
        }
        for stored in store.column_ranges(column)? {
            let clipped = stored.intersection(&range);
            if !clipped.is_empty() {
                available_by_col.insert(column.clone(), clipped);
                break;
            }
        }
    }

    let data = if available_by_col.is_empty() {
        None
    } else {
        Some(rows)
    };

    Ok(CachedRead {
        improvement_direction,
        units,
        missing_timestamp,
        available_by_col,
        data,
    })
}
