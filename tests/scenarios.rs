//! End-to-end runs on the simulated runtime.
//!
//! These tests drive the full orchestration (setup, heartbeat, issue, drain,
//! report) and check what a user of the tool would see.

use std::sync::Arc;

use hits::backend::simulated::SimulatedRuntime;
use hits::backend::DeviceId;
use hits::progress::{ProgressEvent, RecordingProgress};
use hits::{Bench, HitsError, RunConfig, TransferKind};

fn bench(runtime: SimulatedRuntime) -> (Bench, Arc<RecordingProgress>) {
    let sink = Arc::new(RecordingProgress::new());
    let bench = Bench::new(Arc::new(runtime)).with_progress(sink.clone());
    (bench, sink)
}

/// One host to device transfer, 1 MiB, 10 iterations
#[tokio::test]
async fn test_single_host_to_device() {
    let (bench, sink) = bench(SimulatedRuntime::new(1));
    let config = RunConfig::builder()
        .host_to_device(0)
        .transfer_size(1_048_576)
        .iterations(10)
        .sysfs_root("/nonexistent")
        .build()
        .unwrap();

    let report = bench.run(&config).await.unwrap();

    assert_eq!(report.transfers.len(), 1);
    let result = &report.transfers[0];
    assert_eq!(result.index, 0);
    assert_eq!(result.kind, TransferKind::HostToDevice);
    assert_eq!(result.device, DeviceId(0));
    assert!(result.elapsed_seconds > 0.0);
    assert!(result.gbps > 0.0);

    // 10 MiB at 25 GB/s over pinned memory
    assert!((result.gbps - 25.0).abs() < 0.01, "got {}", result.gbps);

    let line = result.to_string();
    assert!(line.starts_with("Transfer 0 - Direct transfers (Host to Device) with Device 0 (0x03): "));
    assert!(line.ends_with(" seconds)"));

    assert_eq!(
        sink.announcements(),
        vec!["Launching Host to Device transfers with Device 0 (0x03)".to_string()]
    );
}

/// Peer transfer between devices without a peer link
#[tokio::test]
async fn test_peer_transfer_without_peer_access() {
    let runtime = Arc::new(SimulatedRuntime::new(2));
    let sink = Arc::new(RecordingProgress::new());
    let bench = Bench::new(runtime.clone()).with_progress(sink.clone());
    let config = RunConfig::builder()
        .device_to_device(0, 1)
        .transfer_size(1 << 20)
        .iterations(10)
        .build()
        .unwrap();

    let err = bench.run(&config).await.unwrap_err();

    assert!(matches!(
        err,
        HitsError::PeerAccessUnsupported {
            device: DeviceId(0),
            peer: DeviceId(1)
        }
    ));
    let message = err.to_string();
    assert!(message.contains('0') && message.contains('1'));
    assert_eq!(err.exit_code(), 1);

    assert!(sink.results().is_empty());
    assert!(sink.announcements().is_empty());
    assert_eq!(runtime.device_memory_used(DeviceId(0)), 0);
    assert_eq!(runtime.device_memory_used(DeviceId(1)), 0);
}

/// Three concurrent transfers of different kinds
#[tokio::test]
async fn test_three_concurrent_transfers() {
    let (bench, sink) = bench(SimulatedRuntime::fully_connected(2));
    let config = RunConfig::builder()
        .host_to_device(0)
        .device_to_host(1)
        .device_to_device(0, 1)
        .transfer_size(1 << 20)
        .iterations(10)
        .sysfs_root("/nonexistent")
        .build()
        .unwrap();

    let report = bench.run(&config).await.unwrap();

    let kinds: Vec<_> = report.transfers.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TransferKind::HostToDevice,
            TransferKind::DeviceToHost,
            TransferKind::DeviceToDevice
        ]
    );
    for (i, result) in report.transfers.iter().enumerate() {
        assert_eq!(result.index, i);
        assert!(result.gbps > 0.0);
        assert!(result.elapsed_seconds > 0.0);
    }

    // each stream runs at its own link rate
    assert!((report.transfers[0].gbps - 25.0).abs() < 0.01);
    assert!((report.transfers[1].gbps - 26.0).abs() < 0.01);
    assert!((report.transfers[2].gbps - 50.0).abs() < 0.01);
    assert_eq!(report.transfers[2].peer, Some((DeviceId(1), 0x23)));

    assert_eq!(sink.results(), report.transfers);
    let announcements = sink.announcements();
    assert_eq!(announcements.len(), 3);
    assert_eq!(
        announcements[2],
        "Launching P2P PCIe transfers from Device 1 (0x23) to Device 0 (0x03)"
    );
}

/// Completion is reported after every announcement and before any result
#[tokio::test]
async fn test_completion_separates_launch_and_results() {
    let (bench, sink) = bench(SimulatedRuntime::new(2));
    let config = RunConfig::builder()
        .device_to_host(0)
        .device_to_host(1)
        .transfer_size(4096)
        .iterations(3)
        .sysfs_root("/nonexistent")
        .build()
        .unwrap();

    bench.run(&config).await.unwrap();

    let events: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| !matches!(e, ProgressEvent::Tick))
        .collect();
    let completed = events
        .iter()
        .position(|e| *e == ProgressEvent::Completed)
        .unwrap();
    assert_eq!(completed, 2);
    assert!(events[..completed]
        .iter()
        .all(|e| matches!(e, ProgressEvent::Started(_))));
    assert!(events[completed + 1..]
        .iter()
        .all(|e| matches!(e, ProgressEvent::Result(_))));
}

/// Same configuration, same runtime model, same numbers
#[tokio::test]
async fn test_runs_are_repeatable() {
    let config = RunConfig::builder()
        .host_to_device(0)
        .device_to_device(1, 0)
        .transfer_size(1 << 16)
        .iterations(7)
        .pinned(false)
        .sysfs_root("/nonexistent")
        .build()
        .unwrap();

    let (first, _) = bench(SimulatedRuntime::fully_connected(2));
    let (second, _) = bench(SimulatedRuntime::fully_connected(2));
    let a = first.run(&config).await.unwrap();
    let b = second.run(&config).await.unwrap();

    let elapsed = |r: &hits::RunReport| -> Vec<f64> {
        r.transfers.iter().map(|t| t.elapsed_seconds).collect()
    };
    assert_eq!(elapsed(&a), elapsed(&b));

    // again on the same runtime: peer access is already enabled
    let c = first.run(&config).await.unwrap();
    assert_eq!(elapsed(&a), elapsed(&c));
}

/// Pageable host memory is slower than pinned memory
#[tokio::test]
async fn test_pageable_host_memory() {
    let config = |pinned| {
        RunConfig::builder()
            .device_to_host(0)
            .transfer_size(1 << 20)
            .iterations(4)
            .pinned(pinned)
            .numa_aware(false)
            .build()
            .unwrap()
    };

    let (bench, _) = bench(SimulatedRuntime::new(1));
    let pinned = bench.run(&config(true)).await.unwrap();
    let pageable = bench.run(&config(false)).await.unwrap();

    assert!(pageable.transfers[0].gbps < pinned.transfers[0].gbps);
}

/// Size boundary: 1 GiB is accepted, one byte more is not
#[tokio::test]
async fn test_size_boundary() {
    let exact = RunConfig::builder()
        .device_to_host(0)
        .transfer_size(1 << 30)
        .iterations(1)
        .sysfs_root("/nonexistent")
        .build()
        .unwrap();
    let (bench, _) = bench(SimulatedRuntime::new(1));
    let report = bench.run(&exact).await.unwrap();
    assert_eq!(report.transfers[0].transfer_size, 1 << 30);

    let over = RunConfig::builder()
        .device_to_host(0)
        .transfer_size((1 << 30) + 1)
        .build();
    assert!(matches!(
        over,
        Err(HitsError::InvalidConfig { field: "size", .. })
    ));
}

/// Zero iterations never reach the device
#[tokio::test]
async fn test_zero_iterations() {
    let runtime = Arc::new(SimulatedRuntime::new(1));
    let bench = Bench::new(runtime.clone()).with_progress(Arc::new(RecordingProgress::new()));
    let mut config = RunConfig::quick();
    config.transfers.push(hits::TransferRequest::host_to_device(0));
    config.iterations = 0;

    let err = bench.run(&config).await.unwrap_err();
    assert!(err.is_config_error());
    assert_eq!(runtime.device_memory_used(DeviceId(0)), 0);
}

/// Device memory exhaustion exits with the runtime's code
#[tokio::test]
async fn test_out_of_device_memory() {
    let (bench, sink) = bench(SimulatedRuntime::builder().device_memory(1 << 20).build());
    let config = RunConfig::builder()
        .host_to_device(0)
        .host_to_device(0)
        .transfer_size(1 << 20)
        .iterations(1)
        .sysfs_root("/nonexistent")
        .build()
        .unwrap();

    let err = bench.run(&config).await.unwrap_err();
    assert!(matches!(err, HitsError::Runtime { code: 2, .. }));
    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("hipMalloc"));
    assert!(sink.events().is_empty());
}
