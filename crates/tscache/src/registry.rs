//! Process-wide registry of live requests and slice coalescing.
//!
//! New requests subtract work already in flight for the same timeseries:
//! when a live peer's slice covers one of ours on a shared column, that
//! column moves out of our slice and we consume ("borrow") the peer's
//! memoized response instead of re-fetching it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use crate::identity::COL_REVISION;
use crate::slice::{DataSlice, SliceSpec};

/// One registered in-flight request: its store name plus the slices it
/// launched. Peers read the slices to coalesce against them.
pub struct LiveRequest {
    pub store_name: String,
    pub slices: Vec<Arc<DataSlice>>,
}

type LiveRegistry = HashMap<String, Vec<Weak<LiveRequest>>>;

static LIVE_REQUESTS: OnceLock<RwLock<LiveRegistry>> = OnceLock::new();

fn live_requests() -> &'static RwLock<LiveRegistry> {
    LIVE_REQUESTS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a request so later overlapping requests can borrow its slices.
pub fn register(request: &Arc<LiveRequest>) {
    let mut registry = live_requests()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    registry
        .entry(request.store_name.clone())
        .or_default()
        .push(Arc::downgrade(request));
}

/// Drop a completed request and any peers that have already gone away.
pub fn deregister(request: &Arc<LiveRequest>) {
    let mut registry = live_requests()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(entries) = registry.get_mut(&request.store_name) {
        entries.retain(|entry| {
            entry
                .upgrade()
                .is_some_and(|live| !Arc::ptr_eq(&live, request))
        });
        if entries.is_empty() {
            registry.remove(&request.store_name);
        }
    }
}

/// Live peers for one store name. Dead weak refs are skipped; a peer that
/// finishes mid-coalesce still has usable memoized slice responses.
pub fn peers_for(store_name: &str) -> Vec<Arc<LiveRequest>> {
    let registry = live_requests()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    registry
        .get(store_name)
        .map(|entries| entries.iter().filter_map(Weak::upgrade).collect())
        .unwrap_or_default()
}

/// The outcome of coalescing planned slices against live peers.
pub struct Coalesced {
    /// Planned slices that still need their own fetch, pruned of columns
    /// a covering peer slice already carries.
    pub own: Vec<SliceSpec>,
    /// Peer slices whose responses this request will consume.
    pub borrowed: Vec<Arc<DataSlice>>,
}

/// Prune `planned` against every live peer of `store_name`.
///
/// A peer slice that covers a planned slice (intersection at least as long
/// as the planned slice) absorbs every column both carry except `revision`.
/// A peer that covers only part of a planned slice splits it: the covered
/// sub-range borrows the peer's response while the remainder stays a fetch
/// of its own. Slices left with only `revision` are dropped entirely.
pub fn coalesce(store_name: &str, planned: Vec<SliceSpec>) -> Coalesced {
    let peers = peers_for(store_name);
    let mut queue: VecDeque<SliceSpec> = planned.into();
    let mut own = Vec::with_capacity(queue.len());
    let mut borrowed: Vec<Arc<DataSlice>> = Vec::new();

    let mut borrow = |borrowed: &mut Vec<Arc<DataSlice>>, peer_slice: &Arc<DataSlice>| {
        if !borrowed.iter().any(|b| Arc::ptr_eq(b, peer_slice)) {
            borrowed.push(peer_slice.clone());
        }
    };

    'next_slice: while let Some(mut spec) = queue.pop_front() {
        for peer in &peers {
            for peer_slice in &peer.slices {
                let peer_spec = peer_slice.spec();
                let shared: Vec<String> = spec
                    .columns
                    .intersection(&peer_spec.columns)
                    .filter(|column| *column != COL_REVISION)
                    .cloned()
                    .collect();
                if shared.is_empty() {
                    continue;
                }
                let covered = peer_spec.range.intersection(&spec.range);
                // Point intersections dedup nothing; they only arise from
                // touching endpoints.
                if covered.is_empty() || covered.duration() == 0.0 {
                    continue;
                }
                if covered.duration() >= spec.range.duration() {
                    for column in &shared {
                        spec.columns.remove(column);
                    }
                    borrow(&mut borrowed, peer_slice);
                    if spec.columns.iter().all(|column| column == COL_REVISION) {
                        continue 'next_slice;
                    }
                } else {
                    borrow(&mut borrowed, peer_slice);
                    // Uncovered remainders keep the full column set.
                    for remainder in spec.range.difference(&covered) {
                        queue.push_back(SliceSpec {
                            range: remainder,
                            columns: spec.columns.clone(),
                        });
                    }
                    // The covered part continues with the shared columns gone.
                    let mut remaining = spec.columns.clone();
                    for column in &shared {
                        remaining.remove(column);
                    }
                    if remaining.iter().any(|column| column != COL_REVISION) {
                        queue.push_back(SliceSpec {
                            range: covered,
                            columns: remaining,
                        });
                    }
                    continue 'next_slice;
                }
            }
        }
        if spec.columns.iter().any(|column| column != COL_REVISION) {
            own.push(spec);
        }
    }

    Coalesced { own, borrowed }
}
