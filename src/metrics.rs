//! Labeled in-memory metrics
//!
//! Every metric is registered once with a kind and a set of label names. Each
//! distinct label set gets its own series. Label sets are `BTreeMap`s, so the
//! same labels always land in the same series no matter in which order the
//! caller built them.
//!
//! ## Retention
//!
//! A series is trimmed by one rule, applied both when a value is appended and
//! on the periodic sweep:
//!
//! ```text
//! 1. drop values older than `retention` from the front
//! 2. then drop from the front until len <= max_values_per_series
//! ```
//!
//! Histogram bucket counters are not subject to retention. They only go away
//! through `reset`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, trace};

use crate::error::MetricsError;
use crate::events::{EventBus, EventMeta, EventPayload, EventSource, Priority};

/// Label name → label value
pub type Labels = BTreeMap<String, String>;

/// Default histogram ladder
pub const DEFAULT_BUCKETS: [f64; 12] = [
    0.005,
    0.01,
    0.025,
    0.05,
    0.1,
    0.25,
    0.5,
    1.0,
    2.5,
    5.0,
    10.0,
    f64::INFINITY,
];

/// Build a label set from pairs
pub fn labels<I, K, V>(pairs: I) -> Labels
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Stable textual key of a label set, e.g. `host="a",region="eu"`
pub fn label_key(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",")
}

/// True when `labels` contains every pair of `filter`
pub fn labels_match(labels: &Labels, filter: &Labels) -> bool {
    filter.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    #[serde(default)]
    pub help: String,
    pub kind: MetricKind,
    #[serde(default)]
    pub label_names: Vec<String>,
    /// Custom bucket upper bounds (histograms only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<f64>>,
}

impl MetricDefinition {
    fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            help: String::new(),
            kind,
            label_names: Vec::new(),
            buckets: None,
        }
    }

    pub fn counter(name: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    pub fn gauge(name: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Gauge)
    }

    pub fn histogram(name: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Histogram)
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    pub fn with_labels<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.label_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = Some(buckets);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricValue {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub labels: Labels,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramBucket {
    /// Inclusive upper bound
    pub le: f64,
    pub count: u64,
}

/// Payload of the `MetricCollected` event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
}

/// Runtime options of the collector
#[derive(Debug, Clone)]
pub struct MetricsOptions {
    pub retention: Duration,
    pub max_values_per_series: usize,
    pub cleanup_interval: Duration,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            max_values_per_series: 1000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct MetricEntry {
    definition: MetricDefinition,
    /// Resolved bucket ladder, empty unless this is a histogram
    ladder: Vec<f64>,
    series: BTreeMap<Labels, VecDeque<MetricValue>>,
    histograms: BTreeMap<Labels, Vec<HistogramBucket>>,
}

impl MetricEntry {
    fn empty_buckets(&self) -> Vec<HistogramBucket> {
        self.ladder
            .iter()
            .map(|&le| HistogramBucket { le, count: 0 })
            .collect()
    }

    fn clear(&mut self) {
        self.series.clear();
        self.histograms.clear();
    }
}

/// Drop expired values, then enforce the length cap. Returns how many were removed.
fn enforce_retention(
    series: &mut VecDeque<MetricValue>,
    cutoff: DateTime<Utc>,
    max_len: usize,
) -> usize {
    let before = series.len();
    while series.front().is_some_and(|v| v.timestamp < cutoff) {
        series.pop_front();
    }
    while series.len() > max_len {
        series.pop_front();
    }
    before - series.len()
}

fn resolve_ladder(definition: &MetricDefinition) -> Result<Vec<f64>, MetricsError> {
    if definition.kind != MetricKind::Histogram {
        return Ok(Vec::new());
    }

    let Some(custom) = &definition.buckets else {
        return Ok(DEFAULT_BUCKETS.to_vec());
    };

    let increasing = custom.windows(2).all(|w| w[0] < w[1]);
    if custom.is_empty() || !increasing || custom.iter().any(|b| b.is_nan()) {
        return Err(MetricsError::InvalidBuckets(definition.name.clone()));
    }

    let mut ladder = custom.clone();
    if ladder.last() != Some(&f64::INFINITY) {
        ladder.push(f64::INFINITY);
    }
    Ok(ladder)
}

/// Thread-safe metrics registry
///
/// Cloning is cheap; all clones share the same store.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<HashMap<String, MetricEntry>>>,
    options: MetricsOptions,
    events: Option<EventBus>,
}

impl MetricsCollector {
    pub fn new(options: MetricsOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            options,
            events: None,
        }
    }

    /// Publish a `MetricCollected` event for every recorded value
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn options(&self) -> &MetricsOptions {
        &self.options
    }

    pub fn register_metric(&self, definition: MetricDefinition) -> Result<(), MetricsError> {
        let ladder = resolve_ladder(&definition)?;
        let mut metrics = self.inner.write();

        if metrics.contains_key(&definition.name) {
            return Err(MetricsError::AlreadyRegistered(definition.name));
        }

        debug!("registering {} `{}`", definition.kind, definition.name);
        metrics.insert(
            definition.name.clone(),
            MetricEntry {
                definition,
                ladder,
                series: BTreeMap::new(),
                histograms: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    /// Add `value` to a counter
    pub fn increment(&self, name: &str, value: f64, labels: &Labels) -> Result<(), MetricsError> {
        if value < 0.0 {
            return Err(MetricsError::InvalidValue {
                metric: name.to_string(),
                value,
            });
        }
        self.record(name, MetricKind::Counter, value, labels)
    }

    /// Set a gauge
    pub fn gauge(&self, name: &str, value: f64, labels: &Labels) -> Result<(), MetricsError> {
        self.record(name, MetricKind::Gauge, value, labels)
    }

    /// Record a histogram observation
    pub fn observe(&self, name: &str, value: f64, labels: &Labels) -> Result<(), MetricsError> {
        self.record(name, MetricKind::Histogram, value, labels)
    }

    fn record(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        labels: &Labels,
    ) -> Result<(), MetricsError> {
        if !value.is_finite() {
            return Err(MetricsError::InvalidValue {
                metric: name.to_string(),
                value,
            });
        }

        let sample = {
            let mut metrics = self.inner.write();
            let entry = metrics
                .get_mut(name)
                .ok_or_else(|| MetricsError::UnknownMetric(name.to_string()))?;

            if entry.definition.kind != kind {
                return Err(MetricsError::KindMismatch {
                    name: name.to_string(),
                    expected: kind,
                    actual: entry.definition.kind,
                });
            }

            if let Some(label) = labels
                .keys()
                .find(|label| !entry.definition.label_names.contains(*label))
            {
                return Err(MetricsError::UnknownLabel {
                    metric: name.to_string(),
                    label: label.clone(),
                });
            }

            if kind == MetricKind::Histogram {
                let fresh = entry.empty_buckets();
                let buckets = entry
                    .histograms
                    .entry(labels.clone())
                    .or_insert(fresh);
                for bucket in buckets.iter_mut().filter(|b| value <= b.le) {
                    bucket.count += 1;
                }
            }

            let now = Utc::now();
            let series = entry.series.entry(labels.clone()).or_default();
            series.push_back(MetricValue {
                value,
                timestamp: now,
                labels: labels.clone(),
            });
            let cutoff = self.cutoff(now);
            enforce_retention(series, cutoff, self.options.max_values_per_series);

            MetricSample {
                name: name.to_string(),
                kind,
                value,
                labels: labels.clone(),
                timestamp: now,
            }
        };

        trace!("recorded {} {} = {}", sample.kind, sample.name, sample.value);

        if let Some(events) = &self.events {
            events.publish(
                EventPayload::MetricCollected(sample),
                EventMeta::new(EventSource::Monitor, Priority::Low),
            );
        }

        Ok(())
    }

    /// Oldest timestamp still inside the retention window
    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.options.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn with_entry<T>(
        &self,
        name: &str,
        f: impl FnOnce(&MetricEntry) -> T,
    ) -> Result<T, MetricsError> {
        let metrics = self.inner.read();
        let entry = metrics
            .get(name)
            .ok_or_else(|| MetricsError::UnknownMetric(name.to_string()))?;
        Ok(f(entry))
    }

    /// All retained values of one series, oldest first
    pub fn get_metric_values(
        &self,
        name: &str,
        labels: &Labels,
    ) -> Result<Vec<MetricValue>, MetricsError> {
        self.recent_values(name, labels, usize::MAX)
    }

    /// The last `n` values of one series, oldest first
    pub fn recent_values(
        &self,
        name: &str,
        labels: &Labels,
        n: usize,
    ) -> Result<Vec<MetricValue>, MetricsError> {
        self.with_entry(name, |entry| {
            entry
                .series
                .get(labels)
                .map(|series| {
                    let skip = series.len().saturating_sub(n);
                    series.iter().skip(skip).cloned().collect()
                })
                .unwrap_or_default()
        })
    }

    /// The value recorded right before the one stamped `timestamp`
    ///
    /// Falls back to the newest older value when the stamped value itself
    /// was already trimmed.
    pub fn value_before(
        &self,
        name: &str,
        labels: &Labels,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<MetricValue>, MetricsError> {
        self.with_entry(name, |entry| {
            let series = entry.series.get(labels)?;
            let at = series.iter().rposition(|v| v.timestamp <= timestamp)?;
            if series[at].timestamp < timestamp {
                return series.get(at).cloned();
            }
            at.checked_sub(1).and_then(|i| series.get(i)).cloned()
        })
    }

    /// Every series whose labels superset-match `filter`, with its last `n` values
    pub fn matching_series(
        &self,
        name: &str,
        filter: &Labels,
        n: usize,
    ) -> Result<Vec<(Labels, Vec<MetricValue>)>, MetricsError> {
        self.with_entry(name, |entry| {
            entry
                .series
                .iter()
                .filter(|(labels, _)| labels_match(labels, filter))
                .map(|(labels, series)| {
                    let skip = series.len().saturating_sub(n);
                    (labels.clone(), series.iter().skip(skip).cloned().collect())
                })
                .collect()
        })
    }

    pub fn get_histogram_data(
        &self,
        name: &str,
        labels: &Labels,
    ) -> Result<Vec<HistogramBucket>, MetricsError> {
        self.with_entry(name, |entry| {
            if entry.definition.kind != MetricKind::Histogram {
                return Err(MetricsError::KindMismatch {
                    name: name.to_string(),
                    expected: MetricKind::Histogram,
                    actual: entry.definition.kind,
                });
            }
            Ok(entry
                .histograms
                .get(labels)
                .cloned()
                .unwrap_or_else(|| entry.empty_buckets()))
        })?
    }

    pub fn definition(&self, name: &str) -> Option<MetricDefinition> {
        self.inner.read().get(name).map(|e| e.definition.clone())
    }

    /// All definitions, sorted by name
    pub fn definitions(&self) -> Vec<MetricDefinition> {
        let mut definitions: Vec<_> = self
            .inner
            .read()
            .values()
            .map(|e| e.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Clear recorded data of one metric, or of all metrics. Definitions stay.
    pub fn reset(&self, name: Option<&str>) {
        let mut metrics = self.inner.write();
        match name {
            Some(name) => {
                if let Some(entry) = metrics.get_mut(name) {
                    entry.clear();
                }
            }
            None => metrics.values_mut().for_each(MetricEntry::clear),
        }
    }

    /// Apply the retention policy to every series now
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        let max_len = self.options.max_values_per_series;
        let mut removed = 0;

        let mut metrics = self.inner.write();
        for entry in metrics.values_mut() {
            for series in entry.series.values_mut() {
                removed += enforce_retention(series, cutoff, max_len);
            }
            entry.series.retain(|_, series| !series.is_empty());
        }

        removed
    }

    /// Run `sweep` every `cleanup_interval` until stopped
    pub fn spawn_cleanup(&self) -> CleanupHandle {
        let collector = self.clone();
        let period = self.options.cleanup_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = collector.sweep();
                if removed > 0 {
                    debug!("metrics sweep removed {removed} expired values");
                }
            }
        });

        CleanupHandle { task }
    }

    /// Diagnostic dump of every definition and series
    pub fn export(&self) -> MetricsExport {
        let metrics = self.inner.read();
        let metrics = metrics
            .iter()
            .map(|(name, entry)| {
                let exported = ExportedMetric {
                    definition: entry.definition.clone(),
                    series: entry
                        .series
                        .iter()
                        .map(|(labels, values)| ExportedSeries {
                            labels: labels.clone(),
                            values: values.iter().cloned().collect(),
                        })
                        .collect(),
                    histograms: entry
                        .histograms
                        .iter()
                        .map(|(labels, buckets)| ExportedHistogram {
                            labels: labels.clone(),
                            buckets: buckets.clone(),
                        })
                        .collect(),
                };
                (name.clone(), exported)
            })
            .collect();

        MetricsExport { metrics }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsOptions::default())
    }
}

/// Handle of the periodic sweeper
pub struct CleanupHandle {
    task: JoinHandle<()>,
}

impl CleanupHandle {
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsExport {
    pub metrics: BTreeMap<String, ExportedMetric>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedMetric {
    pub definition: MetricDefinition,
    pub series: Vec<ExportedSeries>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub histograms: Vec<ExportedHistogram>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedSeries {
    pub labels: Labels,
    pub values: Vec<MetricValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedHistogram {
    pub labels: Labels,
    pub buckets: Vec<HistogramBucket>,
}
