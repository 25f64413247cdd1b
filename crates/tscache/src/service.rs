//! Crate front door: wires stores, transport, and the backend URL into a
//! per-request snapshot stream.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::generator::{ResultGenerator, Snapshot};
use crate::request::CacheRequest;
use crate::store::SeriesStoreProvider;
use crate::transport::Transport;

/// The cache service hosted by the surrounding runtime.
///
/// The first snapshot out of `stream` belongs on the immediate response;
/// the rest go to the side channel named by `channel_name`.
#[derive(Clone)]
pub struct TimeseriesCache {
    stores: Arc<dyn SeriesStoreProvider>,
    transport: Arc<dyn Transport>,
    backend_url: String,
}

impl TimeseriesCache {
    pub fn new(
        stores: Arc<dyn SeriesStoreProvider>,
        transport: Arc<dyn Transport>,
        backend_url: impl Into<String>,
    ) -> Self {
        Self {
            stores,
            transport,
            backend_url: backend_url.into(),
        }
    }

    /// Start serving one request; snapshots arrive in emission order.
    pub fn stream(&self, request: CacheRequest) -> anyhow::Result<mpsc::Receiver<Snapshot>> {
        tracing::debug!(
            store = %request.identity.store_name(),
            columns = ?request.columns,
            "serving timeseries request"
        );
        let store = self.stores.series(&request.identity)?;
        let generator = ResultGenerator::new(
            request,
            store,
            self.transport.clone(),
            self.backend_url.clone(),
        );
        Ok(generator.stream())
    }

    /// The side-channel name for a request's follow-up snapshots.
    pub fn channel_name(&self, request: &CacheRequest) -> String {
        request.channel_name(&self.backend_url)
    }
}
