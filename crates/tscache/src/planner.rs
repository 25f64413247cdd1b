//! Slice planning: the minimal set of remote fetches for one request.

use std::collections::{BTreeMap, BTreeSet};

use crate::identity::{COL_ALERT, COL_HISTOGRAM, COL_REVISION};
use crate::range::Range;
use crate::slice::SliceSpec;

/// Plan the slices needed to cover `request` for `columns`, given the
/// cached availability clipped to the request.
///
/// Histograms always travel in their own slices. Columns whose cached
/// availability spans the whole request drop out; `alert` never does, so
/// requesting it forces a live fetch while cached columns still serve from
/// the store. The remaining columns share slices over the sub-ranges not
/// covered by their common cached intersection.
pub fn plan_slices(
    columns: &BTreeSet<String>,
    request: &Range,
    available_by_col: &BTreeMap<String, Range>,
) -> Vec<SliceSpec> {
    let mut remaining = columns.clone();
    let mut slices = Vec::new();

    if remaining.remove(COL_HISTOGRAM) {
        let have = available_by_col
            .get(COL_HISTOGRAM)
            .copied()
            .unwrap_or_else(Range::empty);
        for missing in request.difference(&have) {
            slices.push(SliceSpec::new(missing, [COL_HISTOGRAM]));
        }
    }

    // Columns whose cached intersection spans the whole request are served
    // locally. `alert` is never recorded as available, so it never drops.
    remaining.retain(|column| {
        if column == COL_REVISION || column == COL_ALERT {
            return true;
        }
        available_by_col
            .get(column)
            .map_or(true, |have| have.duration() < request.duration())
    });

    // Nothing left but the key column: the cache satisfies everything else.
    if remaining.iter().all(|column| column == COL_REVISION) {
        return slices;
    }

    // The request minus the intersection of what every remaining column has
    // cached is what still needs fetching. A column with no availability
    // collapses the intersection to empty.
    let mut common: Option<Range> = None;
    for column in remaining.iter().filter(|c| *c != COL_REVISION) {
        let have = available_by_col
            .get(column)
            .copied()
            .unwrap_or_else(Range::empty);
        common = Some(match common {
            None => have,
            Some(current) => current.intersection(&have),
        });
    }
    let common = common.unwrap_or_else(Range::empty);

    for missing in request.difference(&common) {
        slices.push(SliceSpec::new(missing, remaining.iter().cloned()));
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn available(entries: &[(&str, Range)]) -> BTreeMap<String, Range> {
        entries
            .iter()
            .map(|(name, range)| (name.to_string(), *range))
            .collect()
    }

    #[test]
    fn cold_cache_yields_one_slice_over_the_request() {
        let plan = plan_slices(
            &columns(&["revision", "avg"]),
            &Range::new(0.0, 100.0),
            &BTreeMap::new(),
        );
        assert_eq!(plan, vec![SliceSpec::new(Range::new(0.0, 100.0), ["avg"])]);
    }

    #[test]
    fn fully_cached_request_plans_nothing() {
        let plan = plan_slices(
            &columns(&["revision", "avg"]),
            &Range::new(0.0, 100.0),
            &available(&[("avg", Range::new(0.0, 100.0))]),
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn partial_cache_fetches_only_the_gap() {
        let plan = plan_slices(
            &columns(&["revision", "avg"]),
            &Range::new(50.0, 200.0),
            &available(&[("avg", Range::new(50.0, 100.0))]),
        );
        assert_eq!(plan, vec![SliceSpec::new(Range::new(100.0, 200.0), ["avg"])]);
    }

    #[test]
    fn alert_forces_a_fetch_even_when_others_are_cached() {
        let plan = plan_slices(
            &columns(&["revision", "avg", "alert"]),
            &Range::new(0.0, 100.0),
            &available(&[("avg", Range::new(0.0, 100.0))]),
        );
        assert_eq!(plan, vec![SliceSpec::new(Range::new(0.0, 100.0), ["alert"])]);
    }

    #[test]
    fn histogram_travels_in_its_own_slices() {
        let plan = plan_slices(
            &columns(&["revision", "avg", "histogram"]),
            &Range::new(0.0, 100.0),
            &available(&[
                ("avg", Range::new(0.0, 100.0)),
                ("histogram", Range::new(40.0, 60.0)),
            ]),
        );
        assert_eq!(
            plan,
            vec![
                SliceSpec::new(Range::new(0.0, 40.0), ["histogram"]),
                SliceSpec::new(Range::new(60.0, 100.0), ["histogram"]),
            ]
        );
    }

    #[test]
    fn histogram_slices_survive_the_all_cached_short_circuit() {
        let plan = plan_slices(
            &columns(&["revision", "histogram"]),
            &Range::new(0.0, 100.0),
            &BTreeMap::new(),
        );
        assert_eq!(
            plan,
            vec![SliceSpec::new(Range::new(0.0, 100.0), ["histogram"])]
        );
    }

    #[test]
    fn interior_gap_produces_two_covering_slices() {
        // Two columns cached over different spans share the common core;
        // everything outside it is fetched for both.
        let plan = plan_slices(
            &columns(&["revision", "avg", "count"]),
            &Range::new(0.0, 100.0),
            &available(&[
                ("avg", Range::new(20.0, 80.0)),
                ("count", Range::new(30.0, 90.0)),
            ]),
        );
        assert_eq!(
            plan,
            vec![
                SliceSpec::new(Range::new(0.0, 30.0), ["avg", "count"]),
                SliceSpec::new(Range::new(80.0, 100.0), ["avg", "count"]),
            ]
        );
    }

    #[test]
    fn planned_slices_cover_the_request_for_every_column() {
        let request = Range::new(0.0, 1000.0);
        let avail = available(&[("avg", Range::new(100.0, 400.0))]);
        let plan = plan_slices(&columns(&["revision", "avg"]), &request, &avail);

        // Union of cached availability and planned slice ranges covers the
        // request; planned slices never overlap each other.
        let mut covered = avail["avg"].merge_into(&[]);
        for spec in &plan {
            for already in &covered {
                assert!(spec.range.intersection(already).duration() == 0.0
                    || spec.range.intersection(already).is_empty());
            }
            covered = spec.range.merge_into(&covered);
        }
        assert_eq!(covered, vec![request]);
    }
}
