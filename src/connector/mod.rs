//! Connector contract and registry
//!
//! Connectors are the pluggable analyzers. They are statically linked and
//! registered through a build-time factory table - no dynamic module
//! loading. At startup each factory gets the parsed contents of the first
//! `<dir>/<name>/config.yml` found under `connector_dirs` (or None) and
//! either produces a live connector or leaves it unavailable.
//!
//! A connector's `analyze` returns a pull-stream of result drafts. The
//! analysis pipeline drains the stream incrementally, which is what makes
//! batched dispatch and timeout salvage work: results produced before a
//! timeout have already been persisted and buffered.

pub mod null;

use crate::model::{Binary, ResultDraft};
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What `analyze` hands back: a stream of drafts, any of which may fail.
pub type ResultStream = BoxStream<'static, anyhow::Result<ResultDraft>>;

/// A pluggable analyzer.
pub trait Connector: Send + Sync {
    /// Lowercase identifier; also the key into `config.sinks`.
    fn name(&self) -> &'static str;

    /// Analyze one binary. `data` is the cached bytes; the returned stream
    /// is drained by the pipeline, one draft at a time.
    fn analyze(&self, binary: &Binary, data: Bytes) -> ResultStream;
}

/// Build-time registration record for one connector.
pub struct ConnectorFactory {
    pub name: &'static str,
    /// Receives the connector's parsed `config.yml`, if one was found.
    pub build: fn(Option<serde_yaml::Value>) -> anyhow::Result<Arc<dyn Connector>>,
}

/// The connectors compiled into this binary.
pub fn builtin_factories() -> Vec<ConnectorFactory> {
    vec![null::factory()]
}

/// The set of live connectors, fixed at startup.
pub struct Registry {
    connectors: Vec<Arc<dyn Connector>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("connectors", &self.connectors.iter().map(|c| c.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Instantiate every factory, feeding it its sibling config. A factory
    /// that fails leaves its connector out of the set (the rest of the
    /// system is unaffected); two factories claiming the same name is a
    /// startup error.
    pub fn load(
        factories: Vec<ConnectorFactory>,
        connector_dirs: &[PathBuf],
    ) -> anyhow::Result<Self> {
        let mut names = HashSet::new();
        for factory in &factories {
            if !names.insert(factory.name) {
                anyhow::bail!("connector {} is registered twice", factory.name);
            }
        }

        let mut connectors: Vec<Arc<dyn Connector>> = Vec::new();
        for factory in factories {
            let config = match find_config(connector_dirs, factory.name) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(
                        connector = factory.name,
                        "failed to load connector config: {}",
                        e
                    );
                    continue;
                }
            };
            match (factory.build)(config) {
                Ok(connector) => {
                    tracing::info!(connector = factory.name, "loaded connector");
                    connectors.push(connector);
                }
                Err(e) => {
                    tracing::error!(
                        connector = factory.name,
                        "connector unavailable: {}",
                        e
                    );
                }
            }
        }

        tracing::info!(
            "loaded connectors: {}",
            connectors
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Self { connectors })
    }

    /// Build a registry from already-constructed connectors (tests).
    pub fn from_connectors(connectors: Vec<Arc<dyn Connector>>) -> anyhow::Result<Self> {
        let mut names = HashSet::new();
        for connector in &connectors {
            if !names.insert(connector.name()) {
                anyhow::bail!("connector {} is registered twice", connector.name());
            }
        }
        Ok(Self { connectors })
    }

    pub fn connectors(&self) -> &[Arc<dyn Connector>] {
        &self.connectors
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.iter().find(|c| c.name() == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

/// First `<dir>/<name>/config.yml` under the configured search paths.
/// A missing file is fine (None); an unreadable or unparsable one is an
/// error, which marks the connector unavailable.
fn find_config(
    connector_dirs: &[PathBuf],
    name: &str,
) -> anyhow::Result<Option<serde_yaml::Value>> {
    for dir in connector_dirs {
        if !dir.is_dir() {
            tracing::debug!("{} is not a directory, skipping", dir.display());
            continue;
        }
        let path = dir.join(name).join("config.yml");
        if path.is_file() {
            return parse_config(&path).map(Some);
        }
    }
    Ok(None)
}

fn parse_config(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    struct Fixed {
        name: &'static str,
    }

    impl Connector for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn analyze(&self, _binary: &Binary, _data: Bytes) -> ResultStream {
            Box::pin(stream::empty())
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = Registry::from_connectors(vec![
            Arc::new(Fixed { name: "dup" }),
            Arc::new(Fixed { name: "dup" }),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("registered twice"));
    }

    #[test]
    fn test_failed_factory_is_skipped() {
        let factories = vec![
            ConnectorFactory {
                name: "broken",
                build: |_| anyhow::bail!("rule compilation failed"),
            },
            ConnectorFactory {
                name: "ok",
                build: |_| Ok(Arc::new(Fixed { name: "ok" }) as Arc<dyn Connector>),
            },
        ];
        let registry = Registry::load(factories, &[]).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("broken").is_none());
        assert!(registry.get("ok").is_some());
    }

    #[test]
    fn test_config_discovered_in_sibling_dir() {
        let dir = tempfile::tempdir().unwrap();
        let conn_dir = dir.path().join("testconn");
        std::fs::create_dir_all(&conn_dir).unwrap();
        std::fs::write(conn_dir.join("config.yml"), "threshold: 42\n").unwrap();

        let config = find_config(&[dir.path().to_path_buf()], "testconn")
            .unwrap()
            .unwrap();
        assert_eq!(config["threshold"], serde_yaml::Value::from(42));
    }

    #[test]
    fn test_bad_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let conn_dir = dir.path().join("testconn");
        std::fs::create_dir_all(&conn_dir).unwrap();
        std::fs::write(conn_dir.join("config.yml"), "threshold: [unclosed\n").unwrap();

        assert!(find_config(&[dir.path().to_path_buf()], "testconn").is_err());
    }

    #[test]
    fn test_missing_config_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_config(&[dir.path().to_path_buf()], "testconn")
            .unwrap()
            .is_none());
    }
}
