//! Client-side time-series cache and request coalescer.
//!
//! Sits between a page and a remote analytics backend. For a timeseries
//! identity and a requested revision range × column set it answers from a
//! local keyed store where possible, fetches only the missing slices, joins
//! in-flight requests for the same timeseries so overlapping slices are
//! shared, and streams merged snapshots back as each slice resolves.

pub mod generator;
pub mod identity;
pub mod planner;
pub mod range;
pub mod reader;
pub mod registry;
pub mod request;
pub mod rows;
pub mod service;
pub mod slice;
pub mod store;
pub mod transport;
pub mod writer;

pub use generator::{ResultGenerator, Snapshot, MISSING_RETRY_WINDOW};
pub use identity::{TimeseriesIdentity, COL_ALERT, COL_HISTOGRAM, COL_REVISION};
pub use range::Range;
pub use request::{CacheRequest, RequestError};
pub use rows::DataRow;
pub use service::TimeseriesCache;
pub use slice::{DataSlice, SliceOutcome, SliceSpec};
pub use store::{MemoryProvider, MemoryStore, SeriesStore, SeriesStoreProvider, StoreCatalog, WriteBatch};
pub use transport::{HttpReply, HttpTransport, Transport};
