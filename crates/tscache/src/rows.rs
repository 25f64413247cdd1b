//! Revision-keyed data rows and the insertion-sort merge used to combine
//! cached rows with slice responses.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::identity::COL_REVISION;

/// One data point: a revision plus the fetched column values.
///
/// Fields merge shallowly, last write wins. The JSON form is flat, with
/// `revision` inline next to the other columns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataRow {
    pub revision: u64,
    pub fields: BTreeMap<String, Value>,
}

impl DataRow {
    pub fn new(revision: u64) -> Self {
        Self {
            revision,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    /// Overlay `other`'s fields onto this row, last write wins.
    pub fn merge_fields(&mut self, other: &DataRow) {
        for (column, value) in &other.fields {
            self.fields.insert(column.clone(), value.clone());
        }
    }
}

impl Serialize for DataRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry(COL_REVISION, &self.revision)?;
        for (column, value) in &self.fields {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DataRow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = DataRow;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a map with a numeric `{COL_REVISION}` entry")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<DataRow, A::Error> {
                let mut revision = None;
                let mut fields = BTreeMap::new();
                while let Some((column, value)) = access.next_entry::<String, Value>()? {
                    if column == COL_REVISION {
                        revision = value.as_u64();
                    } else {
                        fields.insert(column, value);
                    }
                }
                let revision = revision
                    .ok_or_else(|| serde::de::Error::custom("row is missing its revision"))?;
                Ok(DataRow { revision, fields })
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

/// Smallest index whose revision is `>= revision`, or `rows.len()`.
/// Returns 0 on an empty slice.
pub fn lower_bound(rows: &[DataRow], revision: u64) -> usize {
    rows.partition_point(|row| row.revision < revision)
}

/// Merge `input` rows into `target`, keeping `target` sorted ascending by
/// revision. Rows with an existing revision shallow-merge their fields
/// (last write wins); new revisions are inserted in place.
pub fn merge_rows(target: &mut Vec<DataRow>, input: &[DataRow]) {
    for row in input {
        let index = lower_bound(target, row.revision);
        if index < target.len() && target[index].revision == row.revision {
            target[index].merge_fields(row);
        } else {
            target.insert(index, row.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(revision: u64, value: f64) -> DataRow {
        DataRow::new(revision).with_field("avg", value)
    }

    #[test]
    fn lower_bound_on_empty_is_zero() {
        assert_eq!(lower_bound(&[], 10), 0);
    }

    #[test]
    fn lower_bound_finds_first_at_or_above() {
        let rows = vec![row(10, 1.0), row(20, 2.0), row(30, 3.0)];
        assert_eq!(lower_bound(&rows, 5), 0);
        assert_eq!(lower_bound(&rows, 20), 1);
        assert_eq!(lower_bound(&rows, 25), 2);
        assert_eq!(lower_bound(&rows, 40), 3);
    }

    #[test]
    fn merge_inserts_and_keeps_order() {
        let mut target = vec![row(10, 1.0), row(30, 3.0)];
        merge_rows(&mut target, &[row(20, 2.0), row(5, 0.5)]);
        let revisions: Vec<u64> = target.iter().map(|r| r.revision).collect();
        assert_eq!(revisions, vec![5, 10, 20, 30]);
    }

    #[test]
    fn merge_is_last_write_wins_per_field() {
        let mut target = vec![row(10, 1.0)];
        let update = DataRow::new(10)
            .with_field("avg", 9.0)
            .with_field("count", 4);
        merge_rows(&mut target, &[update]);
        assert_eq!(target.len(), 1);
        assert_eq!(target[0].fields["avg"], json!(9.0));
        assert_eq!(target[0].fields["count"], json!(4));
    }

    #[test]
    fn merge_into_single_element_target_from_empty_search() {
        // Regression guard: an insert position past the end would panic.
        let mut target = Vec::new();
        merge_rows(&mut target, &[row(10, 1.0)]);
        merge_rows(&mut target, &[row(20, 2.0)]);
        assert_eq!(target.len(), 2);
    }

    #[test]
    fn rows_round_trip_flat_json() {
        let original = row(42, 7.5).with_field("count", 3);
        let json = serde_json::to_value(&original).unwrap();
        assert_eq!(json, json!({"revision": 42, "avg": 7.5, "count": 3}));
        let back: DataRow = serde_json::from_value(json).unwrap();
        assert_eq!(back, original);
    }
}
