use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Width of the rolling window backing the fetch-duration percentiles.
const DURATION_WINDOW: Duration = Duration::from_secs(300);

/// Process-wide metrics registry.
///
/// Counters follow the contract of the HTTP surface; fetch durations feed a
/// 5-minute rolling window from which p50/p95/p99 gauges are computed at
/// scrape time.
pub struct Metrics {
    registry: Registry,

    pub jobs_total: IntCounterVec,
    pub fetch_total: IntCounterVec,
    pub playwright_fallback_total: IntCounter,
    pub cache_hits_total: IntCounter,
    pub hash_hits_total: IntCounter,
    pub robots_blocked_total: IntCounter,
    pub ssrf_blocked_total: IntCounter,
    pub rate_limit_total: IntCounter,
    pub active_jobs: IntGaugeVec,

    fetch_duration_p50: IntGauge,
    fetch_duration_p95: IntGauge,
    fetch_duration_p99: IntGauge,
    durations: Mutex<VecDeque<(Instant, u64)>>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("jobs_total", "Jobs by type and terminal status"),
            &["type", "status"],
        )
        .expect("valid metric definition");
        let fetch_total = IntCounterVec::new(
            Opts::new("fetch_total", "Outbound fetches by renderer and status"),
            &["renderer", "status_code"],
        )
        .expect("valid metric definition");
        let playwright_fallback_total = IntCounter::new(
            "playwright_fallback_total",
            "Escalations from HTTP fetch to the headless browser",
        )
        .expect("valid metric definition");
        let cache_hits_total =
            IntCounter::new("cache_hits_total", "Scrape responses served from cache")
                .expect("valid metric definition");
        let hash_hits_total = IntCounter::new(
            "hash_hits_total",
            "Refetches short-circuited by content hash match",
        )
        .expect("valid metric definition");
        let robots_blocked_total =
            IntCounter::new("robots_blocked_total", "URLs denied by robots.txt")
                .expect("valid metric definition");
        let ssrf_blocked_total =
            IntCounter::new("ssrf_blocked_total", "URLs denied by the SSRF guard")
                .expect("valid metric definition");
        let rate_limit_total = IntCounter::new(
            "rate_limit_total",
            "Requests denied by the per-credential rate limit",
        )
        .expect("valid metric definition");
        let active_jobs = IntGaugeVec::new(
            Opts::new("active_jobs", "Currently running jobs by type"),
            &["type"],
        )
        .expect("valid metric definition");
        let fetch_duration_p50 =
            IntGauge::new("fetch_duration_ms_p50", "Fetch duration p50 over 5m")
                .expect("valid metric definition");
        let fetch_duration_p95 =
            IntGauge::new("fetch_duration_ms_p95", "Fetch duration p95 over 5m")
                .expect("valid metric definition");
        let fetch_duration_p99 =
            IntGauge::new("fetch_duration_ms_p99", "Fetch duration p99 over 5m")
                .expect("valid metric definition");

        for collector in [
            Box::new(jobs_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(fetch_total.clone()),
            Box::new(playwright_fallback_total.clone()),
            Box::new(cache_hits_total.clone()),
            Box::new(hash_hits_total.clone()),
            Box::new(robots_blocked_total.clone()),
            Box::new(ssrf_blocked_total.clone()),
            Box::new(rate_limit_total.clone()),
            Box::new(active_jobs.clone()),
            Box::new(fetch_duration_p50.clone()),
            Box::new(fetch_duration_p95.clone()),
            Box::new(fetch_duration_p99.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registers once");
        }

        Metrics {
            registry,
            jobs_total,
            fetch_total,
            playwright_fallback_total,
            cache_hits_total,
            hash_hits_total,
            robots_blocked_total,
            ssrf_blocked_total,
            rate_limit_total,
            active_jobs,
            fetch_duration_p50,
            fetch_duration_p95,
            fetch_duration_p99,
            durations: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one completed fetch: counter plus a duration sample.
    pub fn record_fetch(&self, renderer: &str, status_code: u16, duration_ms: u64) {
        self.fetch_total
            .with_label_values(&[renderer, &status_code.to_string()])
            .inc();
        if let Ok(mut window) = self.durations.lock() {
            window.push_back((Instant::now(), duration_ms));
        }
    }

    pub fn record_job_status(&self, job_type: &str, status: &str) {
        self.jobs_total.with_label_values(&[job_type, status]).inc();
    }

    /// Render the registry in Prometheus text format, refreshing the rolling
    /// percentile gauges first.
    pub fn render(&self) -> String {
        let (p50, p95, p99) = self.percentiles();
        self.fetch_duration_p50.set(p50 as i64);
        self.fetch_duration_p95.set(p95 as i64);
        self.fetch_duration_p99.set(p99 as i64);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    fn percentiles(&self) -> (u64, u64, u64) {
        let mut window = match self.durations.lock() {
            Ok(w) => w,
            Err(_) => return (0, 0, 0),
        };
        if let Some(cutoff) = Instant::now().checked_sub(DURATION_WINDOW) {
            while window.front().is_some_and(|(t, _)| *t < cutoff) {
                window.pop_front();
            }
        }
        if window.is_empty() {
            return (0, 0, 0);
        }
        let mut sorted: Vec<u64> = window.iter().map(|(_, d)| *d).collect();
        sorted.sort_unstable();
        let pick = |q: f64| {
            let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
            sorted[idx]
        };
        (pick(0.5), pick(0.95), pick(0.99))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let m = Metrics::new();
        m.record_fetch("http", 200, 120);
        m.record_fetch("browser", 200, 900);
        m.ssrf_blocked_total.inc();
        m.record_job_status("map", "completed");

        let out = m.render();
        assert!(out.contains(r#"fetch_total{renderer="http",status_code="200"} 1"#));
        assert!(out.contains(r#"fetch_total{renderer="browser",status_code="200"} 1"#));
        assert!(out.contains("ssrf_blocked_total 1"));
        assert!(out.contains(r#"jobs_total{status="completed",type="map"} 1"#));
    }

    #[test]
    fn test_percentiles_empty_window() {
        let m = Metrics::new();
        assert_eq!(m.percentiles(), (0, 0, 0));
    }

    #[test]
    fn test_percentiles_ordering() {
        let m = Metrics::new();
        for d in [10u64, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            m.record_fetch("http", 200, d);
        }
        let (p50, p95, p99) = m.percentiles();
        assert!(p50 >= 50 && p50 <= 60, "p50 was {p50}");
        assert!(p95 >= 90, "p95 was {p95}");
        assert!(p99 >= p95);
    }

    #[test]
    fn test_active_jobs_gauge() {
        let m = Metrics::new();
        m.active_jobs.with_label_values(&["map"]).inc();
        assert_eq!(m.active_jobs.with_label_values(&["map"]).get(), 1);
        m.active_jobs.with_label_values(&["map"]).dec();
        assert_eq!(m.active_jobs.with_label_values(&["map"]).get(), 0);
    }
}
