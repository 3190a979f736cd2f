//! Store selection: which backend to build and whether to trace it.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{MemoryRefStore, DEFAULT_COMMITTER};
use crate::trace::LogSink;
use crate::traced::TracedRefStore;
use crate::traits::RefBackend;

/// Errors raised while loading a [`StoreConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// The concrete backend kinds that can be selected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
}

/// Where traced stores send their trace lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Standard output, one line per record.
    #[default]
    Stdout,
    /// `tracing` events on the `refscope::trace` target.
    Log,
}

/// Configuration for opening a ref store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// Wrap the backend in a [`TracedRefStore`].
    pub trace_refs: bool,
    pub trace_sink: SinkKind,
    /// Identity recorded in reflog entries.
    pub committer: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            trace_refs: false,
            trace_sink: SinkKind::Stdout,
            committer: DEFAULT_COMMITTER.to_string(),
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from TOML text. Missing keys take their
    /// defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

/// Build the store described by `config`.
pub fn open_store(config: &StoreConfig) -> Box<dyn RefBackend> {
    let backend: Box<dyn RefBackend> = match config.backend {
        BackendKind::Memory => {
            Box::new(MemoryRefStore::new().with_committer(config.committer.clone()))
        }
    };
    if config.trace_refs {
        tracing::debug!(backend = backend.name(), sink = ?config.trace_sink, "tracing ref store");
        let traced = match config.trace_sink {
            SinkKind::Stdout => TracedRefStore::wrap_stdout(backend),
            SinkKind::Log => TracedRefStore::wrap(backend, Arc::new(LogSink)),
        };
        Box::new(traced)
    } else {
        backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let c = StoreConfig::default();
        assert_eq!(c.backend, BackendKind::Memory);
        assert!(!c.trace_refs);
        assert_eq!(c.trace_sink, SinkKind::Stdout);
        assert_eq!(c.committer, DEFAULT_COMMITTER);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = StoreConfig::from_toml_str("trace_refs = true\ntrace_sink = \"log\"\n").unwrap();
        assert!(c.trace_refs);
        assert_eq!(c.trace_sink, SinkKind::Log);
        assert_eq!(c.backend, BackendKind::Memory);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = StoreConfig::from_toml_str("backend = \"files\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "committer = \"A U Thor <author@example.com>\"").unwrap();
        let c = StoreConfig::load(file.path()).unwrap();
        assert_eq!(c.committer, "A U Thor <author@example.com>");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = StoreConfig::load("/nonexistent/refscope.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn toml_roundtrip() {
        let c = StoreConfig {
            trace_refs: true,
            ..Default::default()
        };
        let text = c.to_toml_string().unwrap();
        assert_eq!(StoreConfig::from_toml_str(&text).unwrap(), c);
    }

    #[test]
    fn open_store_wraps_when_tracing() {
        let plain = open_store(&StoreConfig::default());
        assert_eq!(plain.name(), "memory");

        let traced = open_store(&StoreConfig {
            trace_refs: true,
            trace_sink: SinkKind::Log,
            ..Default::default()
        });
        assert_eq!(traced.name(), "debug");

        let on_stdout = open_store(&StoreConfig {
            trace_refs: true,
            ..Default::default()
        });
        assert_eq!(on_stdout.name(), "debug");
        assert_ne!(on_stdout.id(), plain.id());
    }
}
