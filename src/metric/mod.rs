// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Lock-free tallies plus per-message-type latency histograms. Everything
//! here is written from many tasks at once; all state is atomics or
//! concurrent maps, and reads are approximate by design.

use std::{
    collections::BTreeMap,
    fs,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{alert::Alerter, cfg::enums::Env};

/// Latency bucket upper bounds in milliseconds; the last entry is the
/// catch-all.
pub const BUCKETS_MS: [i64; 17] = [
    1, 5, 10, 20, 50, 100, 150, 200, 250, 300, 400, 500, 1000, 2000, 5000, 10000,
    9_999_999_999,
];

/// Fixed-bucket latency counter with a p99 readout.
#[derive(Debug, Default)]
pub struct P99 {
    count: AtomicI64,
    buckets: [AtomicI64; 17],
}

impl P99 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one sample into the smallest bucket that can hold it.
    pub fn observe(&self, value_ms: i64) {
        for (i, bound) in BUCKETS_MS.iter().enumerate() {
            if *bound >= value_ms {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                self.count.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    /// Returns the smallest bucket bound whose cumulative share reaches
    /// 0.99, or 0 when nothing was recorded since the last reset.
    pub fn p99(&self) -> i64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }

        let mut sum = 0i64;
        for (i, bound) in BUCKETS_MS.iter().enumerate() {
            sum += self.buckets[i].load(Ordering::Relaxed);
            if sum as f64 / count as f64 >= 0.99 {
                return *bound;
            }
        }

        0
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
    }
}

/// Per-protocol latency histograms, created lazily on first observation.
///
/// Two tasks may race on first creation of the same entry; both end up with
/// the same bucket vector, so at worst one early sample lands in the copy
/// that loses the insert.
#[derive(Debug, Default)]
pub struct ProtoP99 {
    inner: DashMap<String, Arc<P99>>,
}

impl ProtoP99 {
    pub fn observe(&self, proto: &str, value_ms: i64) {
        let hist = self
            .inner
            .entry(proto.to_string())
            .or_insert_with(|| Arc::new(P99::new()))
            .clone();
        hist.observe(value_ms);
    }

    /// Per-protocol p99 values; entries with no samples are omitted.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        let mut out = BTreeMap::new();
        for entry in self.inner.iter() {
            let v = entry.value().p99();
            if v > 0 {
                out.insert(entry.key().clone(), v);
            }
        }
        out
    }

    pub fn reset(&self) {
        for entry in self.inner.iter() {
            entry.value().reset();
        }
    }
}

/// All gauges and histograms the gateway maintains.
#[derive(Debug)]
pub struct Metrics {
    start_time: Instant,

    /// Live TCP connections (gauge, never reset).
    pub count_connection: AtomicI64,
    /// Inbound framed requests read off client sockets.
    pub count_public_tcp_request: AtomicI64,
    /// Outbound HTTP calls dispatched towards the backend.
    pub count_public_http_request: AtomicI64,
    /// Requests served by the control plane.
    pub count_private_http_request: AtomicI64,

    /// Alive tokio tasks at the last sample.
    pub count_alive_tasks: AtomicU64,
    pub mem_resident: AtomicU64,
    pub mem_virtual: AtomicU64,
    pub mem_data: AtomicU64,
    pub mem_stack: AtomicU64,
    pub count_threads: AtomicU64,

    /// Latency of the full pipeline, keyed by message id.
    pub p99_public: ProtoP99,
    /// Latency of control-plane requests, keyed by path.
    pub p99_private: ProtoP99,

    last_report: Mutex<String>,
    last_tcp_states: Mutex<BTreeMap<String, u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            count_connection: AtomicI64::new(0),
            count_public_tcp_request: AtomicI64::new(0),
            count_public_http_request: AtomicI64::new(0),
            count_private_http_request: AtomicI64::new(0),
            count_alive_tasks: AtomicU64::new(0),
            mem_resident: AtomicU64::new(0),
            mem_virtual: AtomicU64::new(0),
            mem_data: AtomicU64::new(0),
            mem_stack: AtomicU64::new(0),
            count_threads: AtomicU64::new(0),
            p99_public: ProtoP99::default(),
            p99_private: ProtoP99::default(),
            last_report: Mutex::new(String::new()),
            last_tcp_states: Mutex::new(BTreeMap::new()),
        }
    }

    /// The most recently composed summary, as published to discovery
    /// heartbeats.
    pub fn last_report(&self) -> String {
        self.last_report
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Samples process-level gauges from `/proc/self/status`. Off-Linux (or
    /// if procfs is unreadable) the gauges simply stay at their last value.
    pub fn sample_process(&self) {
        if let Ok(status) = fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                let mut parts = line.split_whitespace();
                let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                    continue;
                };
                let Ok(n) = value.parse::<u64>() else {
                    continue;
                };
                match key {
                    "VmRSS:" => self.mem_resident.store(n * 1024, Ordering::Relaxed),
                    "VmSize:" => self.mem_virtual.store(n * 1024, Ordering::Relaxed),
                    "VmData:" => self.mem_data.store(n * 1024, Ordering::Relaxed),
                    "VmStk:" => self.mem_stack.store(n * 1024, Ordering::Relaxed),
                    "Threads:" => self.count_threads.store(n, Ordering::Relaxed),
                    _ => {},
                }
            }
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            self.count_alive_tasks
                .store(handle.metrics().num_alive_tasks() as u64, Ordering::Relaxed);
        }
    }

    /// Samples kernel TCP socket states from procfs (`/proc/net/tcp{,6}`).
    pub fn sample_tcp_states(&self) {
        let mut states: BTreeMap<String, u64> = BTreeMap::new();
        for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
            let Ok(table) = fs::read_to_string(path) else {
                continue;
            };
            for line in table.lines().skip(1) {
                let Some(state_hex) = line.split_whitespace().nth(3) else {
                    continue;
                };
                let name = match state_hex {
                    "01" => "ESTABLISHED",
                    "02" => "SYN_SENT",
                    "03" => "SYN_RECV",
                    "04" => "FIN_WAIT1",
                    "05" => "FIN_WAIT2",
                    "06" => "TIME_WAIT",
                    "07" => "CLOSE",
                    "08" => "CLOSE_WAIT",
                    "09" => "LAST_ACK",
                    "0A" => "LISTEN",
                    "0B" => "CLOSING",
                    _ => "UNKNOWN",
                };
                *states.entry(name.to_string()).or_default() += 1;
            }
        }

        *self
            .last_tcp_states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = states;
    }

    /// Composes the human-readable summary over the last window and resets
    /// the windowed counters and histograms.
    pub fn collect(&self, interval_secs: i64) -> String {
        self.sample_process();

        let uptime = self.start_time.elapsed();
        let tcp_states = self
            .last_tcp_states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        let report = format!(
            "key: {}\n\
             uptime: {}s\n\
             count connection: {}\n\
             count public tcp request qps: {}\n\
             count private http request qps: {}\n\
             count public http request qps: {}\n\
             count alive tasks: {}\n\
             count threads: {}\n\
             mem resident: {}\n\
             mem virtual: {}\n\
             mem data: {}\n\
             mem stack: {}\n\
             count tcp status: {:?}\n\
             p99 public http request latency: {:?}\n\
             p99 private http request latency: {:?}",
            chrono::Utc::now().timestamp_millis(),
            uptime.as_secs(),
            self.count_connection.load(Ordering::Relaxed),
            self.count_public_tcp_request.load(Ordering::Relaxed) / interval_secs.max(1),
            self.count_private_http_request.load(Ordering::Relaxed)
                / interval_secs.max(1),
            self.count_public_http_request.load(Ordering::Relaxed) / interval_secs.max(1),
            self.count_alive_tasks.load(Ordering::Relaxed),
            self.count_threads.load(Ordering::Relaxed),
            self.mem_resident.load(Ordering::Relaxed),
            self.mem_virtual.load(Ordering::Relaxed),
            self.mem_data.load(Ordering::Relaxed),
            self.mem_stack.load(Ordering::Relaxed),
            tcp_states,
            self.p99_public.snapshot(),
            self.p99_private.snapshot(),
        );

        *self
            .last_report
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = report.clone();

        self.reset_window();

        report
    }

    fn reset_window(&self) {
        self.count_public_tcp_request.store(0, Ordering::Relaxed);
        self.count_private_http_request.store(0, Ordering::Relaxed);
        self.count_public_http_request.store(0, Ordering::Relaxed);
        self.p99_public.reset();
        self.p99_private.reset();
    }
}

/// Spawns the periodic reporter: summary emission at `report_interval`, a
/// TCP-state sample every 60s outside release, and a process sample plus
/// window rollover every 10s.
pub fn spawn_reporter(
    metrics: Arc<Metrics>,
    alerts: Arc<Alerter>,
    env: Env,
    report_interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut t0 = tokio::time::interval(report_interval);
        let mut t1 = tokio::time::interval(Duration::from_secs(60));
        let mut t2 = tokio::time::interval(Duration::from_secs(10));
        t0.tick().await;
        t1.tick().await;
        t2.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("metrics reporter stopped");
                    return;
                },
                _ = t0.tick() => {
                    alerts.auto(metrics.last_report());
                },
                _ = t1.tick() => {
                    if !env.is_release() {
                        metrics.sample_tcp_states();
                    }
                },
                _ = t2.tick() => {
                    metrics.collect(10);
                },
            }
        }
    })
}
