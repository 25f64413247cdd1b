//! Timeseries identity and reserved column names.

use serde::{Deserialize, Serialize};

use crate::request::RequestError;

/// Primary key column. Never fetched alone, never recorded as available.
pub const COL_REVISION: &str = "revision";
/// Always refetched; never recorded as available in the cache.
pub const COL_ALERT: &str = "alert";
/// Always requested in slices of its own.
pub const COL_HISTOGRAM: &str = "histogram";

/// The tuple that names one persistent store instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeseriesIdentity {
    pub test_suite: String,
    pub measurement: String,
    pub bot: String,
    #[serde(default)]
    pub test_case: String,
    #[serde(default)]
    pub build_type: String,
}

impl TimeseriesIdentity {
    /// Build an identity; `test_suite`, `measurement`, and `bot` must be
    /// non-empty. `test_case` and `build_type` default to empty.
    pub fn new(
        test_suite: impl Into<String>,
        measurement: impl Into<String>,
        bot: impl Into<String>,
        test_case: impl Into<String>,
        build_type: impl Into<String>,
    ) -> Result<Self, RequestError> {
        let identity = Self {
            test_suite: test_suite.into(),
            measurement: measurement.into(),
            bot: bot.into(),
            test_case: test_case.into(),
            build_type: build_type.into(),
        };
        for (field, value) in [
            ("test_suite", &identity.test_suite),
            ("measurement", &identity.measurement),
            ("bot", &identity.bot),
        ] {
            if value.is_empty() {
                return Err(RequestError::Malformed(format!("missing {field}")));
            }
        }
        Ok(identity)
    }

    /// The persistent store name for this identity.
    pub fn store_name(&self) -> String {
        format!(
            "timeseries/{}/{}/{}/{}/{}",
            self.test_suite, self.measurement, self.bot, self.test_case, self.build_type
        )
    }
}
