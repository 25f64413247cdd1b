//! One pending remote fetch: a sub-range × column subset.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::OnceCell;
use url::form_urlencoded;

use crate::identity::{TimeseriesIdentity, COL_REVISION};
use crate::range::Range;
use crate::rows::DataRow;
use crate::transport::Transport;

/// Retries allowed after the first attempt on a server error.
pub const MAX_RETRIES: u32 = 3;
pub const STATUS_SERVER_ERROR: u16 = 500;
pub const STATUS_NOT_FOUND: u16 = 404;

/// The shape of one planned fetch. Columns always include `revision`.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceSpec {
    pub range: Range,
    pub columns: BTreeSet<String>,
}

impl SliceSpec {
    pub fn new(range: Range, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut columns: BTreeSet<String> = columns.into_iter().map(Into::into).collect();
        columns.insert(COL_REVISION.to_owned());
        Self { range, columns }
    }
}

/// The memoized result of one slice fetch.
#[derive(Clone, Debug)]
pub enum SliceOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<DataRow>,
        units: Option<Value>,
        improvement_direction: Option<Value>,
    },
    Error {
        message: String,
        /// HTTP status; 0 when the transport itself failed.
        status: u16,
    },
}

/// A single pending remote fetch with lazy-fire semantics.
///
/// Nothing happens until the first `outcome` call; that call performs the
/// fetch (with retries) and every later or concurrent caller observes the
/// same memoized result.
pub struct DataSlice {
    identity: TimeseriesIdentity,
    statistic: String,
    spec: SliceSpec,
    url: String,
    transport: Arc<dyn Transport>,
    response: OnceCell<SliceOutcome>,
}

impl DataSlice {
    pub fn new(
        identity: TimeseriesIdentity,
        statistic: impl Into<String>,
        spec: SliceSpec,
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            identity,
            statistic: statistic.into(),
            spec,
            url: url.into(),
            transport,
            response: OnceCell::new(),
        }
    }

    pub fn spec(&self) -> &SliceSpec {
        &self.spec
    }

    /// The form-encoded request body for this slice.
    ///
    /// Empty identity parts and unset bounds are omitted; `max_revision` is
    /// omitted when the slice is unbounded above.
    pub fn form_body(&self) -> String {
        let columns = self
            .spec
            .columns
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        let mut body = form_urlencoded::Serializer::new(String::new());
        body.append_pair("test_suite", &self.identity.test_suite);
        body.append_pair("measurement", &self.identity.measurement);
        body.append_pair("bot", &self.identity.bot);
        body.append_pair("statistic", &self.statistic);
        body.append_pair("columns", &columns);
        if !self.identity.build_type.is_empty() {
            body.append_pair("build_type", &self.identity.build_type);
        }
        if !self.identity.test_case.is_empty() {
            body.append_pair("test_case", &self.identity.test_case);
        }
        if self.spec.range.min() > 0.0 && self.spec.range.min().is_finite() {
            body.append_pair("min_revision", &format!("{}", self.spec.range.min() as u64));
        }
        if self.spec.range.max().is_finite() {
            body.append_pair("max_revision", &format!("{}", self.spec.range.max() as u64));
        }
        body.finish()
    }

    /// Fire the fetch on first call; memoized for all callers.
    pub async fn outcome(&self) -> &SliceOutcome {
        self.response.get_or_init(|| self.fetch()).await
    }

    async fn fetch(&self) -> SliceOutcome {
        let body = self.form_body();
        let mut retries = 0u32;
        loop {
            tracing::debug!(url = %self.url, body = %body, retries, "fetching timeseries slice");
            let reply = match self.transport.post_form(&self.url, &body).await {
                Ok(reply) => reply,
                Err(err) => {
                    return SliceOutcome::Error {
                        message: format!("{err:#}"),
                        status: 0,
                    }
                }
            };
            if reply.status == STATUS_SERVER_ERROR && retries < MAX_RETRIES {
                retries += 1;
                continue;
            }
            if !reply.is_ok() {
                let message = reply
                    .body
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("remote fetch failed")
                    .to_owned();
                return SliceOutcome::Error {
                    message,
                    status: reply.status,
                };
            }
            return self.decode(reply.body);
        }
    }

    /// Rewrite the 2-D response table into row objects keyed by the
    /// requested columns (positional zip). The response's own column list
    /// is discarded in favor of the requested one.
    fn decode(&self, body: Value) -> SliceOutcome {
        let columns: Vec<String> = self.spec.columns.iter().cloned().collect();
        let table = body.get("data").and_then(Value::as_array);
        let mut rows = Vec::with_capacity(table.map_or(0, Vec::len));
        for cells in table.into_iter().flatten() {
            let Some(cells) = cells.as_array() else {
                continue;
            };
            let mut row = None;
            let mut fields = Vec::with_capacity(columns.len());
            for (column, cell) in columns.iter().zip(cells) {
                if column == COL_REVISION {
                    row = cell.as_u64().map(DataRow::new);
                } else {
                    fields.push((column.clone(), cell.clone()));
                }
            }
            // Rows without a usable revision cannot be keyed; drop them.
            let Some(mut row) = row else {
                continue;
            };
            for (column, value) in fields {
                row.fields.insert(column, value);
            }
            rows.push(row);
        }
        SliceOutcome::Rows {
            columns,
            rows,
            units: body.get("units").cloned(),
            improvement_direction: body.get("improvement_direction").cloned(),
        }
    }
}
