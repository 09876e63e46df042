//! Canopy: a reactive state engine for component trees.
//!
//! Canopy gives every component of a page a typed state made of reactive
//! props, changed only by reducers and observed through frame-aligned
//! batches:
//! - Reactive props aliased across parent/child states and global stores
//! - Reducers and sub-reducers with scoped, re-entrancy safe dispatch
//! - Effects, interceptors and a hierarchical dispatch bus
//! - Frame-aligned, de-duplicated change batches per view applier
//! - Asynchronous state detection on worker threads
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  Runtime (infrastructure/)                          │  ← Main context
//! │  - Main-thread task queue, detection workers        │
//! │  - App-level dispatch bus                           │
//! └─────────────────────────────────────────────────────┘
//!                        │
//! ┌─────────────────────────────────────────────────────┐
//! │  Page & components (component/)                     │  ← Install state machine
//! │  - Dependant/Connector installs                     │
//! │  - Lifecycle, visibility, queued operations         │
//! └─────────────────────────────────────────────────────┘
//!         │                    │                    │
//! ┌───────────────┐   ┌───────────────┐   ┌───────────────┐
//! │ Stores        │   │ Effects       │   │ Worker        │
//! │ (store/)      │   │ (effect/)     │   │ (worker/)     │
//! │ - Dispatch    │   │ - Handlers    │   │ - Detection   │
//! │ - Frame batch │   │ - Interceptors│   │ - Trace ctx   │
//! │ - Globals     │   │ - Bus (bus/)  │   │               │
//! └───────────────┘   └───────────────┘   └───────────────┘
//!         │                    │                    │
//! ┌─────────────────────────────────────────────────────┐
//! │  State & reducers (state/, reducer/, domain/)       │
//! │  - ReactiveProp, State, StateDecl                   │
//! │  - Reducer, SubReducer, Action, errors              │
//! └─────────────────────────────────────────────────────┘
//!                        │
//! ┌─────────────────────────────────────────────────────┐
//! │  Observability (observability/)                     │  ← Optional
//! │  - tracing subscriber, rotating log file            │
//! │  - File-based OTLP export                           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`domain`]: actions, payloads, errors
//! - [`state`]: reactive props and state containers
//! - [`reducer`]: reducers and sub-reducers
//! - [`effect`]: effects and interceptors
//! - [`store`]: page and global stores, frame ticker
//! - [`bus`]: hierarchical dispatch bus
//! - [`component`]: components, connectors, the page tree
//! - [`worker`]: detection jobs and worker threads
//! - [`infrastructure`]: runtime, platform handle, paths
//! - [`observability`]: tracing setup
//!
//! # Configuration
//!
//! ```toml
//! tick_interval_ms = 16
//! min_frame_spacing_ms = 16
//! detection_workers = 1
//! async_install = true
//! frame_ticker = true
//! trace_level = "debug"
//! log_file = "~/.local/share/canopy/canopy.log"
//! trace_export = "traces.jsonl"
//! ```
//!
//! Relative log and trace paths resolve against [`infrastructure::data_dir`].
//!
//! # Example
//!
//! ```rust
//! use canopy::component::{Component, Connector, Dependant, LifecycleEvent, Page};
//! use canopy::infrastructure::Runtime;
//! use canopy::state::StateDecl;
//! use canopy::Config;
//!
//! struct Home;
//!
//! impl Component for Home {
//!     fn name(&self) -> &str {
//!         "home"
//!     }
//!
//!     fn state(&self) -> StateDecl {
//!         StateDecl::new().field("title", "Home")
//!     }
//! }
//!
//! let runtime = Runtime::new(Config {
//!     frame_ticker: false,
//!     ..Config::default()
//! })?;
//! let page = Page::new(&runtime, "home", Dependant::new(Home, Connector::new()))?;
//! page.on_lifecycle(LifecycleEvent::Create);
//! assert_eq!(page.component_count(), 1);
//! # Ok::<(), canopy::CanopyError>(())
//! ```

#![allow(clippy::multiple_crate_versions)]

pub mod bus;
pub mod component;
pub mod domain;
pub mod effect;
pub mod infrastructure;
pub mod observability;
pub mod reducer;
pub mod state;
pub mod store;
pub mod worker;

pub use component::{Component, ComponentContext, ComponentHandle, Dependant, Page};
pub use domain::{Action, CanopyError, Payload, Result};
pub use infrastructure::Runtime;
pub use state::{State, StateDecl};
pub use store::{GlobalStore, PageStore};

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_TICK_MS: u64 = 16;
const DEFAULT_SPACING_MS: u64 = 16;
const DEFAULT_DETECTION_WORKERS: usize = 1;

/// Engine configuration.
///
/// Built from defaults, a string map ([`Config::from_map`]) or a TOML file
/// ([`Config::load`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Period of the frame ticker. Default: 16 ms
    pub tick_interval: Duration,

    /// Minimum spacing between two batch fires of a page. Default: 16 ms
    pub min_frame_spacing: Duration,

    /// Number of detection worker threads. `0` detects inline. Default: 1
    pub detection_workers: usize,

    /// Whether eligible children detect their state asynchronously.
    ///
    /// Default: `true`
    pub async_install: bool,

    /// Whether each page spawns a frame ticker thread.
    ///
    /// Without one, batches fire only on explicit `Page::tick` calls.
    /// Default: `true`
    pub frame_ticker: bool,

    /// Filter directive for the tracing subscriber.
    ///
    /// Options: `trace`, `debug`, `info`, `warn`, `error`, or any
    /// `EnvFilter` directive. Default: `"info"`
    pub trace_level: Option<String>,

    /// Log file; logs go to stderr when unset.
    pub log_file: Option<PathBuf>,

    /// OTLP JSON span export file; no export when unset.
    pub trace_export: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
            min_frame_spacing: Duration::from_millis(DEFAULT_SPACING_MS),
            detection_workers: DEFAULT_DETECTION_WORKERS,
            async_install: true,
            frame_ticker: true,
            trace_level: None,
            log_file: None,
            trace_export: None,
        }
    }
}

/// On-disk shape of [`Config`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    tick_interval_ms: Option<u64>,
    min_frame_spacing_ms: Option<u64>,
    detection_workers: Option<usize>,
    async_install: Option<bool>,
    frame_ticker: Option<bool>,
    trace_level: Option<String>,
    log_file: Option<String>,
    trace_export: Option<String>,
}

impl From<ConfigFile> for Config {
    fn from(file: ConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            tick_interval: file
                .tick_interval_ms
                .filter(|ms| *ms > 0)
                .map_or(defaults.tick_interval, Duration::from_millis),
            min_frame_spacing: file
                .min_frame_spacing_ms
                .map_or(defaults.min_frame_spacing, Duration::from_millis),
            detection_workers: file.detection_workers.unwrap_or(defaults.detection_workers),
            async_install: file.async_install.unwrap_or(defaults.async_install),
            frame_ticker: file.frame_ticker.unwrap_or(defaults.frame_ticker),
            trace_level: file.trace_level,
            log_file: file.log_file.as_deref().map(resolve_path),
            trace_export: file.trace_export.as_deref().map(resolve_path),
        }
    }
}

impl Config {
    /// Parses configuration from a string map.
    ///
    /// Every key is optional; a missing or unparsable value falls back to
    /// its default.
    ///
    /// # Parsing Rules
    ///
    /// - `tick_interval_ms`: String → `u64` milliseconds, must be non-zero
    /// - `min_frame_spacing_ms`: String → `u64` milliseconds
    /// - `detection_workers`: String → `usize`
    /// - `async_install`, `frame_ticker`: `"true"` / `"false"`
    /// - `trace_level`: String → `Option<String>`
    /// - `log_file`, `trace_export`: tilde-expanded, relative paths resolve
    ///   against the data directory
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::collections::BTreeMap;
    /// use std::time::Duration;
    /// use canopy::Config;
    ///
    /// let mut map = BTreeMap::new();
    /// map.insert("tick_interval_ms".to_string(), "8".to_string());
    /// map.insert("detection_workers".to_string(), "lots".to_string());
    ///
    /// let config = Config::from_map(&map);
    /// assert_eq!(config.tick_interval, Duration::from_millis(8));
    /// assert_eq!(config.detection_workers, 1);
    /// ```
    #[must_use]
    pub fn from_map(config: &BTreeMap<String, String>) -> Self {
        let parsed = |key: &str| config.get(key).map(|s| s.trim().to_string());

        ConfigFile {
            tick_interval_ms: parsed("tick_interval_ms").and_then(|s| s.parse().ok()),
            min_frame_spacing_ms: parsed("min_frame_spacing_ms").and_then(|s| s.parse().ok()),
            detection_workers: parsed("detection_workers").and_then(|s| s.parse().ok()),
            async_install: parsed("async_install").and_then(|s| s.parse().ok()),
            frame_ticker: parsed("frame_ticker").and_then(|s| s.parse().ok()),
            trace_level: parsed("trace_level").filter(|s| !s.is_empty()),
            log_file: parsed("log_file").filter(|s| !s.is_empty()),
            trace_export: parsed("trace_export").filter(|s| !s.is_empty()),
        }
        .into()
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::Config`] on malformed TOML, mistyped values
    /// or unknown keys.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| CanopyError::Config(e.to_string()))?;
        Ok(file.into())
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::Config`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CanopyError::Config(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "loading configuration");
        Self::from_toml_str(&text)
    }
}

fn resolve_path(raw: &str) -> PathBuf {
    let path = PathBuf::from(infrastructure::expand_tilde(raw));
    if path.is_absolute() {
        path
    } else {
        infrastructure::data_dir().join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_map_yields_defaults() {
        assert_eq!(Config::from_map(&BTreeMap::new()), Config::default());
    }

    #[test]
    fn map_values_fall_back_per_key() {
        let map: BTreeMap<String, String> = [
            ("min_frame_spacing_ms", "0"),
            ("tick_interval_ms", "0"),
            ("async_install", "false"),
            ("frame_ticker", "maybe"),
            ("trace_level", "debug"),
            ("log_file", "/tmp/canopy.log"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = Config::from_map(&map);
        assert_eq!(config.min_frame_spacing, Duration::ZERO);
        assert_eq!(config.tick_interval, Duration::from_millis(DEFAULT_TICK_MS));
        assert!(!config.async_install);
        assert!(config.frame_ticker);
        assert_eq!(config.trace_level.as_deref(), Some("debug"));
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/canopy.log")));
    }

    #[test]
    fn toml_parses_and_rejects_unknown_keys() {
        let config = Config::from_toml_str(
            "tick_interval_ms = 4\ndetection_workers = 0\ntrace_export = \"/tmp/spans.jsonl\"\n",
        )
        .unwrap();
        assert_eq!(config.tick_interval, Duration::from_millis(4));
        assert_eq!(config.detection_workers, 0);
        assert_eq!(config.trace_export, Some(PathBuf::from("/tmp/spans.jsonl")));

        let err = Config::from_toml_str("scan_depth = 4").unwrap_err();
        assert!(matches!(err, CanopyError::Config(_)));
    }

    #[test]
    fn load_reads_files_and_reports_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canopy.toml");
        std::fs::write(&path, "frame_ticker = false\n").unwrap();

        assert!(!Config::load(&path).unwrap().frame_ticker);
        assert!(matches!(
            Config::load(dir.path().join("missing.toml")),
            Err(CanopyError::Config(_))
        ));
    }

    #[test]
    fn relative_paths_resolve_under_the_data_dir() {
        assert_eq!(resolve_path("canopy.log"), infrastructure::data_dir().join("canopy.log"));
    }
}
