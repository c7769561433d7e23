// Domain model - binaries, analysis results, IOCs
//
// These are the durable entities of the sandbox. The store (store.rs) owns
// persistence; connectors produce ResultDraft/IocDraft values which the
// analysis pipeline stamps with identity (hash, connector, job) and persists
// as AnalysisResult/Ioc rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A binary that has been (or will be) visited by the connectors.
///
/// Identity is the 64-character lowercase hex SHA-256. `available` tracks
/// whether the bytes are currently resident in the binary cache; rows are
/// never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Binary {
    pub id: i64,
    pub sha256: String,
    pub available: bool,
}

impl Binary {
    /// Cache key holding the binary's bytes.
    pub fn data_key(&self) -> String {
        binary_data_key(&self.sha256)
    }

    /// Cache key holding the number of outstanding analyses.
    pub fn count_key(&self) -> String {
        binary_count_key(&self.sha256)
    }
}

/// Cache key for a binary's bytes. Usable before the store row exists.
pub fn binary_data_key(sha256: &str) -> String {
    format!("/binaries/{}", sha256)
}

/// Cache key for a binary's refcount.
pub fn binary_count_key(sha256: &str) -> String {
    format!("/binaries/{}/refcount", sha256)
}

/// Matching strategy for an IOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Equality,
    Regex,
    Query,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Equality => "equality",
            MatchType::Regex => "regex",
            MatchType::Query => "query",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "equality" => Some(MatchType::Equality),
            "regex" => Some(MatchType::Regex),
            "query" => Some(MatchType::Query),
            _ => None,
        }
    }
}

/// An indicator of compromise detected during an analysis.
///
/// Every IOC belongs to an AnalysisResult and is deleted with it.
#[derive(Debug, Clone, Serialize)]
pub struct Ioc {
    pub id: i64,
    pub analysis_id: i64,
    pub match_type: MatchType,
    /// Non-empty list of matchable values.
    pub values: Vec<String>,
    /// The process/report field the values match against.
    pub field: Option<String>,
    /// Link to a description of the IOC.
    pub link: Option<String>,
}

impl Ioc {
    /// The `iocs_v2` dictionary shape expected by feed reports.
    pub fn feed_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id.to_string(),
            "match_type": self.match_type,
            "values": self.values,
            "field": self.field,
            "link": self.link,
        })
    }
}

/// The result of one analysis pass by one connector over one binary.
///
/// `(sha256, connector_name, analysis_name)` is unique across the store;
/// `dispatched` is the only field mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub id: i64,
    pub sha256: String,
    pub connector_name: String,
    pub analysis_name: String,
    /// Severity in [1,10] (normalized on create).
    pub score: i64,
    /// Whether the analysis pass itself failed.
    pub error: bool,
    pub scan_time: DateTime<Utc>,
    /// Opaque structured payload attached by the connector.
    pub payload: serde_json::Value,
    /// 36-char id of the analysis job that produced this result.
    pub job_id: String,
    /// Set once a sink append for this result has succeeded.
    pub dispatched: bool,
    /// Eagerly loaded IOCs.
    pub iocs: Vec<Ioc>,
}

/// An IOC as produced by a connector, before it has identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IocDraft {
    pub match_type: MatchType,
    pub values: Vec<String>,
    pub field: Option<String>,
    pub link: Option<String>,
}

impl IocDraft {
    /// Equality IOC over the given values, the common case.
    pub fn equality(values: Vec<String>, field: Option<String>) -> Self {
        Self {
            match_type: MatchType::Equality,
            values,
            field,
            link: None,
        }
    }
}

/// A result as produced by a connector, before the pipeline stamps it with
/// the binary hash, connector name and job id.
#[derive(Debug, Clone)]
pub struct ResultDraft {
    pub analysis_name: String,
    pub score: i64,
    pub error: bool,
    pub payload: serde_json::Value,
    pub iocs: Vec<IocDraft>,
}

impl ResultDraft {
    pub fn new(analysis_name: impl Into<String>, score: i64) -> Self {
        Self {
            analysis_name: analysis_name.into(),
            score,
            error: false,
            payload: serde_json::Value::Null,
            iocs: Vec::new(),
        }
    }

    pub fn error(analysis_name: impl Into<String>) -> Self {
        Self {
            analysis_name: analysis_name.into(),
            score: 1,
            error: true,
            payload: serde_json::Value::Null,
            iocs: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_ioc(mut self, ioc: IocDraft) -> Self {
        self.iocs.push(ioc);
        self
    }
}

/// Normalize a connector-supplied score into the [1,10] severity band the
/// sink APIs accept. In-band scores pass through untouched; anything else is
/// divided by ten and floored into the band.
pub fn normalize_score(score: i64) -> i64 {
    if score <= 0 || score > 10 {
        tracing::warn!(score, "normalizing out-of-band score");
        (score / 10).clamp(1, 10)
    } else {
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_layout() {
        let binary = Binary {
            id: 1,
            sha256: "a".repeat(64),
            available: true,
        };
        assert_eq!(binary.data_key(), format!("/binaries/{}", "a".repeat(64)));
        assert_eq!(
            binary.count_key(),
            format!("/binaries/{}/refcount", "a".repeat(64))
        );
    }

    #[test]
    fn test_normalize_score_boundaries() {
        assert_eq!(normalize_score(0), 1);
        assert_eq!(normalize_score(15), 1);
        assert_eq!(normalize_score(25), 2);
        assert_eq!(normalize_score(10), 10);
        assert_eq!(normalize_score(1), 1);
        assert_eq!(normalize_score(100), 10);
        assert_eq!(normalize_score(-7), 1);
        // Even absurd scores land inside the band
        assert_eq!(normalize_score(500), 10);
    }

    #[test]
    fn test_match_type_round_trip() {
        for mt in [MatchType::Equality, MatchType::Regex, MatchType::Query] {
            assert_eq!(MatchType::parse(mt.as_str()), Some(mt));
        }
        assert_eq!(MatchType::parse("glob"), None);
    }

    #[test]
    fn test_ioc_feed_dict_stringifies_id() {
        let ioc = Ioc {
            id: 42,
            analysis_id: 7,
            match_type: MatchType::Equality,
            values: vec!["evil.exe".to_string()],
            field: Some("process_name".to_string()),
            link: None,
        };
        let dict = ioc.feed_dict();
        assert_eq!(dict["id"], "42");
        assert_eq!(dict["match_type"], "equality");
        assert_eq!(dict["values"][0], "evil.exe");
    }
}
