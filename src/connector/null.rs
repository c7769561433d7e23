//! The null connector - a do-nothing analyzer for exercising the pipeline
//!
//! Emits exactly one result per binary with a fixed (deliberately
//! out-of-band) score, after an optional artificial delay. Useful for
//! verifying queue plumbing, refcounts and dispatch without any real
//! analysis engine behind it.

use super::{Connector, ConnectorFactory, ResultStream};
use crate::model::{Binary, ResultDraft};
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NullConfig {
    /// Artificial processing delay, to simulate a slow analyzer.
    pub delay_seconds: u64,
    /// Raw score to report; the pipeline normalizes it into [1,10].
    pub score: i64,
}

impl Default for NullConfig {
    fn default() -> Self {
        Self {
            delay_seconds: 0,
            score: 100,
        }
    }
}

pub struct NullConnector {
    config: NullConfig,
}

pub fn factory() -> ConnectorFactory {
    ConnectorFactory {
        name: "null",
        build: |config| {
            let config = match config {
                Some(value) => serde_yaml::from_value(value)?,
                None => NullConfig::default(),
            };
            Ok(Arc::new(NullConnector { config }) as Arc<dyn Connector>)
        },
    }
}

impl Connector for NullConnector {
    fn name(&self) -> &'static str {
        "null"
    }

    fn analyze(&self, binary: &Binary, data: Bytes) -> ResultStream {
        let delay = Duration::from_secs(self.config.delay_seconds);
        let score = self.config.score;
        let sha256 = binary.sha256.clone();

        stream::once(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            tracing::debug!(sha256 = %sha256, "null analysis complete");
            Ok(ResultDraft::new("null", score)
                .with_payload(serde_json::json!({ "size": data.len() })))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn test_binary() -> Binary {
        Binary {
            id: 1,
            sha256: "a".repeat(64),
            available: true,
        }
    }

    #[tokio::test]
    async fn test_emits_single_result() {
        let connector = NullConnector {
            config: NullConfig::default(),
        };
        let drafts: Vec<_> = connector
            .analyze(&test_binary(), Bytes::from_static(b"MZ"))
            .collect()
            .await;
        assert_eq!(drafts.len(), 1);
        let draft = drafts[0].as_ref().unwrap();
        assert_eq!(draft.analysis_name, "null");
        assert_eq!(draft.score, 100);
    }

    #[test]
    fn test_factory_accepts_config() {
        let factory = factory();
        let value: serde_yaml::Value =
            serde_yaml::from_str("delay_seconds: 2\nscore: 7\n").unwrap();
        let connector = (factory.build)(Some(value)).unwrap();
        assert_eq!(connector.name(), "null");
    }

    #[test]
    fn test_factory_rejects_malformed_config() {
        let factory = factory();
        let value: serde_yaml::Value = serde_yaml::from_str("delay_seconds: \"soon\"\n").unwrap();
        assert!((factory.build)(Some(value)).is_err());
    }
}
