//! Inbound request parsing and result-channel naming.

use std::collections::BTreeSet;

use url::form_urlencoded;

use crate::identity::TimeseriesIdentity;
use crate::range::Range;

/// Default statistic when the request names none.
pub const DEFAULT_STATISTIC: &str = "avg";

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),
}

/// One parsed read request against a single timeseries.
#[derive(Clone, Debug)]
pub struct CacheRequest {
    pub identity: TimeseriesIdentity,
    pub statistic: String,
    pub columns: BTreeSet<String>,
    pub min_revision: Option<u64>,
    pub max_revision: Option<u64>,
}

impl CacheRequest {
    /// Parse a form-encoded request body. `columns` is required; identity
    /// fields are validated; revision bounds must be integers when present.
    pub fn from_form_body(body: &str) -> Result<Self, RequestError> {
        let mut columns = None;
        let mut min_revision = None;
        let mut max_revision = None;
        let mut statistic = None;
        let mut test_suite = String::new();
        let mut measurement = String::new();
        let mut bot = String::new();
        let mut test_case = String::new();
        let mut build_type = String::new();

        for (key, value) in form_urlencoded::parse(body.as_bytes()) {
            match key.as_ref() {
                "columns" => columns = Some(value.into_owned()),
                "min_revision" => min_revision = Some(parse_revision("min_revision", &value)?),
                "max_revision" => max_revision = Some(parse_revision("max_revision", &value)?),
                "statistic" => statistic = Some(value.into_owned()),
                "test_suite" => test_suite = value.into_owned(),
                "measurement" => measurement = value.into_owned(),
                "bot" => bot = value.into_owned(),
                "test_case" => test_case = value.into_owned(),
                "build_type" => build_type = value.into_owned(),
                _ => {}
            }
        }

        let columns = columns
            .ok_or_else(|| RequestError::Malformed("missing columns".to_owned()))?;
        let columns: BTreeSet<String> = columns
            .split(',')
            .map(str::trim)
            .filter(|column| !column.is_empty())
            .map(str::to_owned)
            .collect();
        if columns.is_empty() {
            return Err(RequestError::Malformed("missing columns".to_owned()));
        }

        let identity =
            TimeseriesIdentity::new(test_suite, measurement, bot, test_case, build_type)?;

        Ok(Self {
            identity,
            statistic: statistic.unwrap_or_else(|| DEFAULT_STATISTIC.to_owned()),
            columns,
            min_revision,
            max_revision,
        })
    }

    /// The requested interval; unset bounds become `[0, +∞]`.
    pub fn revision_range(&self) -> Range {
        Range::new(
            self.min_revision.map_or(0.0, |min| min as f64),
            self.max_revision.map_or(f64::INFINITY, |max| max as f64),
        )
    }

    /// Canonical form-encoded rendering of this request.
    pub fn form_body(&self) -> String {
        let columns = self.columns.iter().cloned().collect::<Vec<_>>().join(",");
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
        if let Some(min) = self.min_revision.filter(|min| *min > 0) {
            body.append_pair("min_revision", &min.to_string());
        }
        if let Some(max) = self.max_revision {
            body.append_pair("max_revision", &max.to_string());
        }
        body.finish()
    }

    /// Name of the out-of-band channel that carries snapshots after the
    /// first: the request URL plus its encoded body.
    pub fn channel_name(&self, url: &str) -> String {
        format!("{url}?{}", self.form_body())
    }
}

fn parse_revision(field: &str, value: &str) -> Result<u64, RequestError> {
    value
        .parse()
        .map_err(|_| RequestError::Malformed(format!("{field} is not an integer: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::COL_REVISION;

    #[test]
    fn parses_a_full_body() {
        let request = CacheRequest::from_form_body(
            "test_suite=suite&measurement=metric&bot=bot7&columns=revision,avg\
             &min_revision=10&max_revision=200&statistic=std&test_case=case&build_type=ref",
        )
        .unwrap();
        assert_eq!(request.identity.test_suite, "suite");
        assert_eq!(request.identity.build_type, "ref");
        assert_eq!(request.statistic, "std");
        assert!(request.columns.contains(COL_REVISION));
        assert_eq!(request.min_revision, Some(10));
        assert_eq!(request.max_revision, Some(200));
        assert_eq!(request.revision_range(), Range::new(10.0, 200.0));
    }

    #[test]
    fn missing_columns_is_malformed() {
        let err = CacheRequest::from_form_body("test_suite=s&measurement=m&bot=b").unwrap_err();
        assert!(matches!(err, RequestError::Malformed(_)));
    }

    #[test]
    fn statistic_defaults_to_avg_and_bounds_to_unbounded() {
        let request = CacheRequest::from_form_body(
            "test_suite=s&measurement=m&bot=b&columns=revision,avg",
        )
        .unwrap();
        assert_eq!(request.statistic, DEFAULT_STATISTIC);
        assert_eq!(request.revision_range(), Range::new(0.0, f64::INFINITY));
    }

    #[test]
    fn channel_name_is_url_plus_encoded_body() {
        let request = CacheRequest::from_form_body(
            "test_suite=s&measurement=m&bot=b&columns=revision,avg",
        )
        .unwrap();
        let name = request.channel_name("http://host/api/timeseries");
        assert!(name.starts_with("http://host/api/timeseries?"));
        assert!(name.contains("columns=avg%2Crevision"));
    }

    #[test]
    fn non_integer_bounds_are_malformed() {
        let err = CacheRequest::from_form_body(
            "test_suite=s&measurement=m&bot=b&columns=revision&min_revision=abc",
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::Malformed(_)));
    }
}
