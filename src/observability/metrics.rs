//! Execution metrics.
//!
//! Counters and histograms are plain atomics so recording never blocks a
//! worker. Label cardinality is bounded by construction: two languages
//! crossed with a fixed verdict set, and nothing keyed by job or user.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{ExecutionStatus, Language};

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge that can move both ways.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64,
    count: AtomicU64,
}

/// Duration histogram with cumulative buckets.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Buckets spanning 10 ms to ~20 s, doubling: covers the fastest
    /// interpreter hello-world through the longest legal run budget.
    pub fn new_execution() -> Self {
        let bounds = [
            0.01, 0.02, 0.04, 0.08, 0.16, 0.32, 0.64, 1.28, 2.56, 5.12, 10.24, 20.48,
        ];
        Histogram {
            buckets: bounds
                .into_iter()
                .map(|le| HistogramBucket {
                    le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum_micros
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 1e-9)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Per-verdict counters plus the infrastructure "error" label.
#[derive(Debug, Default)]
pub struct VerdictCounters {
    pub success: Counter,
    pub compilation_error: Counter,
    pub runtime_error: Counter,
    pub timeout: Counter,
    pub memory_limit_exceeded: Counter,
    pub internal_error: Counter,
    pub error: Counter,
}

impl VerdictCounters {
    fn record(&self, status: ExecutionStatus) {
        match status {
            ExecutionStatus::Success => self.success.inc(),
            ExecutionStatus::CompilationError => self.compilation_error.inc(),
            ExecutionStatus::RuntimeError => self.runtime_error.inc(),
            ExecutionStatus::Timeout => self.timeout.inc(),
            ExecutionStatus::MemoryLimitExceeded => self.memory_limit_exceeded.inc(),
            ExecutionStatus::InternalError => self.internal_error.inc(),
            // Non-terminal states are never recorded as outcomes.
            ExecutionStatus::Queued | ExecutionStatus::Compiling | ExecutionStatus::Running => {
                self.error.inc()
            }
        }
    }

    fn labelled(&self) -> [(&'static str, &Counter); 7] {
        [
            ("SUCCESS", &self.success),
            ("COMPILATION_ERROR", &self.compilation_error),
            ("RUNTIME_ERROR", &self.runtime_error),
            ("TIMEOUT", &self.timeout),
            ("MEMORY_LIMIT_EXCEEDED", &self.memory_limit_exceeded),
            ("INTERNAL_ERROR", &self.internal_error),
            ("error", &self.error),
        ]
    }
}

#[derive(Debug)]
pub struct LanguageMetrics {
    pub executions: VerdictCounters,
    pub duration: Histogram,
}

impl Default for LanguageMetrics {
    fn default() -> Self {
        LanguageMetrics {
            executions: VerdictCounters::default(),
            duration: Histogram::new_execution(),
        }
    }
}

/// Registry of every metric the worker exposes.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    python: LanguageMetrics,
    cpp: LanguageMetrics,
    pub workers_active: Gauge,
    pub sandbox_failures: Counter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn language(&self, language: Language) -> &LanguageMetrics {
        match language {
            Language::Python => &self.python,
            Language::Cpp => &self.cpp,
        }
    }

    /// Count one terminal verdict.
    pub fn record_execution(&self, language: Language, status: ExecutionStatus) {
        self.language(language).executions.record(status);
    }

    /// Count one infrastructure failure (lock/store/broker) for a job that
    /// produced no verdict.
    pub fn record_execution_error(&self, language: Language) {
        self.language(language).executions.error.inc();
    }

    pub fn observe_duration(&self, language: Language, elapsed: Duration) {
        self.language(language).duration.observe(elapsed);
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP sentinel_executions_total Total number of code executions\n");
        out.push_str("# TYPE sentinel_executions_total counter\n");
        for (language, metrics) in [("python", &self.python), ("cpp", &self.cpp)] {
            for (status, counter) in metrics.executions.labelled() {
                out.push_str(&format!(
                    "sentinel_executions_total{{language=\"{language}\",status=\"{status}\"}} {}\n",
                    counter.get()
                ));
            }
        }

        out.push_str(
            "# HELP sentinel_execution_duration_seconds Duration of code executions in seconds\n",
        );
        out.push_str("# TYPE sentinel_execution_duration_seconds histogram\n");
        for (language, metrics) in [("python", &self.python), ("cpp", &self.cpp)] {
            for bucket in &metrics.duration.buckets {
                out.push_str(&format!(
                    "sentinel_execution_duration_seconds_bucket{{language=\"{language}\",le=\"{}\"}} {}\n",
                    bucket.le,
                    bucket.count.load(Ordering::Relaxed)
                ));
            }
            out.push_str(&format!(
                "sentinel_execution_duration_seconds_bucket{{language=\"{language}\",le=\"+Inf\"}} {}\n",
                metrics.duration.count()
            ));
            out.push_str(&format!(
                "sentinel_execution_duration_seconds_sum{{language=\"{language}\"}} {}\n",
                metrics.duration.sum_seconds()
            ));
            out.push_str(&format!(
                "sentinel_execution_duration_seconds_count{{language=\"{language}\"}} {}\n",
                metrics.duration.count()
            ));
        }

        out.push_str("# HELP sentinel_workers_active Number of workers currently executing a job\n");
        out.push_str("# TYPE sentinel_workers_active gauge\n");
        out.push_str(&format!(
            "sentinel_workers_active {}\n",
            self.workers_active.get()
        ));

        out.push_str(
            "# HELP sentinel_sandbox_failures_total Sandbox infrastructure failures (not user code errors)\n",
        );
        out.push_str("# TYPE sentinel_sandbox_failures_total counter\n");
        out.push_str(&format!(
            "sentinel_sandbox_failures_total {}\n",
            self.sandbox_failures.get()
        ));

        out
    }
}

static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Global metrics registry shared by all components.
pub fn metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}
