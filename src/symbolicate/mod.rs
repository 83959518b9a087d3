//! Stack trace symbolication against uploaded source maps.

pub mod sourcemap;
pub mod store;

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use regex::Regex;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::server::health::HealthMetrics;

pub use sourcemap::{OriginalLocation, SourceMap};
pub use store::{FsSourceMapStore, SourceMapStore};

/// Matches the parenthesized `(url:line:column)` location of a stack frame.
static FRAME_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((.*?):(\d+):(\d+)\)").expect("frame location pattern compiles")
});

#[derive(Debug, Error)]
pub enum SourceMapError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid source map json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported source map version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid mappings: {0}")]
    InvalidMappings(String),
    #[error("invalid path component {0:?}")]
    InvalidName(String),
    #[error("no source map {file} for release {release}")]
    NotFound { release: String, file: String },
    #[error("parse task failed: {0}")]
    Task(String),
}

type CacheKey = (String, String);

/// Rewrites minified stack frames to original source positions.
///
/// Parsed maps are cached per `(release, map file)` for the life of the
/// process. Concurrent requests for the same key share a single parse.
pub struct Symbolicator {
    store: Arc<dyn SourceMapStore>,
    cache: DashMap<CacheKey, Arc<OnceCell<Arc<SourceMap>>>>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl Symbolicator {
    pub fn new(store: Arc<dyn SourceMapStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            metrics: None,
        }
    }

    /// Records hit/miss counts on the given metrics.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of cached map entries.
    pub fn cached_maps(&self) -> usize {
        self.cache.iter().filter(|e| e.value().initialized()).count()
    }

    /// Drops a cached map so the next lookup reloads it from the store.
    pub fn invalidate(&self, release: &str, file: &str) {
        self.cache.remove(&(release.to_string(), file.to_string()));
    }

    /// Symbolicates every frame in `stack` it can resolve.
    ///
    /// Lines without a resolvable location are returned unchanged; the result
    /// always has the same number of lines as the input.
    pub async fn symbolicate(&self, stack: &str, release: &str) -> String {
        if stack.is_empty() || release.is_empty() {
            return stack.to_string();
        }

        let mut lines = Vec::new();
        for line in stack.split('\n') {
            match self.symbolicate_line(line, release).await {
                Some(rewritten) => lines.push(rewritten),
                None => lines.push(line.to_string()),
            }
        }
        lines.join("\n")
    }

    async fn symbolicate_line(&self, line: &str, release: &str) -> Option<String> {
        let caps = FRAME_LOCATION.captures(line)?;
        let full = caps.get(0)?;
        let url = caps.get(1)?.as_str();
        let line_no: u32 = caps.get(2)?.as_str().parse().ok()?;
        let column: u32 = caps.get(3)?.as_str().parse().ok()?;

        let map_file = format!("{}.map", basename(url));

        let map = match self.load(release, &map_file).await {
            Ok(map) => map,
            Err(e) => {
                tracing::debug!(release, file = %map_file, error = %e, "source map unavailable");
                self.record("miss");
                return None;
            }
        };

        let Some(original) = map.lookup(line_no, column).filter(|o| !o.source.is_empty()) else {
            self.record("miss");
            return None;
        };

        self.record("hit");
        Some(format!(
            "{}({}:{}:{}){}",
            &line[..full.start()],
            original.source,
            original.line,
            original.column,
            &line[full.end()..],
        ))
    }

    async fn load(&self, release: &str, file: &str) -> Result<Arc<SourceMap>, SourceMapError> {
        let key = (release.to_string(), file.to_string());
        let cell = self.cache.entry(key.clone()).or_default().clone();

        let result = cell
            .get_or_try_init(|| async {
                let text = self.store.fetch(release, file).await?.ok_or_else(|| {
                    SourceMapError::NotFound {
                        release: release.to_string(),
                        file: file.to_string(),
                    }
                })?;

                let parsed = tokio::task::spawn_blocking(move || SourceMap::parse(&text))
                    .await
                    .map_err(|e| SourceMapError::Task(e.to_string()))??;

                tracing::debug!(release, file, lines = parsed.line_count(), "parsed source map");
                Ok::<_, SourceMapError>(Arc::new(parsed))
            })
            .await;

        match result {
            Ok(map) => Ok(Arc::clone(map)),
            Err(e) => {
                // Failed lookups leave no entry behind.
                self.cache.remove_if(&key, |_, cell| !cell.initialized());
                Err(e)
            }
        }
    }

    fn record(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.symbolication_lookups.with_label_values(&[result]).inc();
        }
    }
}

/// Final path segment of a script URL.
fn basename(url: &str) -> &str {
    url.rsplit(['/', '\\']).next().unwrap_or(url)
}
