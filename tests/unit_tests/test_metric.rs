// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tcp_gateway_rs::metric::{BUCKETS_MS, Metrics, P99, ProtoP99};

#[test]
fn p99_is_zero_without_samples() {
    let hist = P99::new();
    assert_eq!(hist.p99(), 0);
}

#[test]
fn p99_single_sample_lands_in_smallest_fitting_bucket() {
    let hist = P99::new();
    hist.observe(3);
    // 3ms rounds up to the 5ms bucket.
    assert_eq!(hist.p99(), 5);
}

#[test]
fn p99_tracks_the_tail_of_the_distribution() {
    let hist = P99::new();
    // 50 fast samples and one slow one: the slow bucket is the p99.
    for _ in 0..50 {
        hist.observe(1);
    }
    hist.observe(1500);
    assert_eq!(hist.p99(), 2000);

    // With enough fast samples the slow one falls outside the 99th
    // percentile (150/151 > 0.99).
    for _ in 0..100 {
        hist.observe(1);
    }
    assert_eq!(hist.p99(), 1);
}

#[test]
fn p99_handles_values_beyond_the_last_finite_bucket() {
    let hist = P99::new();
    hist.observe(60_000);
    assert_eq!(hist.p99(), *BUCKETS_MS.last().expect("buckets"));
}

#[test]
fn p99_reset_clears_all_buckets() {
    let hist = P99::new();
    hist.observe(10);
    hist.observe(100);
    assert!(hist.p99() > 0);

    hist.reset();
    assert_eq!(hist.p99(), 0);
}

#[test]
fn proto_p99_keeps_ids_apart() {
    let histograms = ProtoP99::default();
    histograms.observe("1500", 1);
    histograms.observe("1501", 450);

    let snap = histograms.snapshot();
    assert_eq!(snap.get("1500"), Some(&1));
    assert_eq!(snap.get("1501"), Some(&500));

    histograms.reset();
    assert!(histograms.snapshot().is_empty());
}

#[test]
fn collect_resets_the_window_but_not_the_gauges() {
    let metrics = Metrics::new();
    metrics
        .count_connection
        .fetch_add(3, std::sync::atomic::Ordering::Relaxed);
    metrics
        .count_public_tcp_request
        .fetch_add(100, std::sync::atomic::Ordering::Relaxed);
    metrics.p99_public.observe("1500", 20);

    let report = metrics.collect(10);
    assert!(report.contains("count connection: 3"));
    assert!(report.contains("count public tcp request qps: 10"));
    assert_eq!(metrics.last_report(), report);

    // Windowed counters and histograms are gone, the connection gauge stays.
    assert_eq!(
        metrics
            .count_public_tcp_request
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
    assert_eq!(
        metrics
            .count_connection
            .load(std::sync::atomic::Ordering::Relaxed),
        3
    );
    assert!(metrics.p99_public.snapshot().is_empty());
}
