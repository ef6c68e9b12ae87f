// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{wait_until, Harness};
use common::mocks::{scripted_byte, CapturingSink};
use harvest_agent::adaptor::writeahead::{decode_records, WriteaheadBuffered};
use harvest_agent::adaptor::ShutdownPolicy;
use harvest_agent::config::AdaptorSettings;
use harvest_agent::registry::AdaptorEntry;

/// Stops `id` for a restart and re-adds it from its live entry, the way the
/// watchdog does.
async fn restart(h: &Harness, id: &str) -> AdaptorEntry {
    let entry = h.registry.entry_by_id(id).unwrap();
    h.registry
        .stop_adaptor(id, ShutdownPolicy::Restarting)
        .await
        .unwrap();
    h.registry
        .process_add_command(&format!(
            "add {} = {} {} {}",
            entry.id, entry.class, entry.status, entry.offset
        ))
        .await
        .unwrap();
    h.registry.entry_by_id(id).unwrap()
}

#[tokio::test]
async fn test_mem_buffer_replays_uncommitted_chunks_on_restart() {
    let h = Harness::new(CapturingSink::committing_up_to(20));
    h.registry
        .process_add_command("add m = MemBuffered Scripted raw 10 50 0")
        .await
        .unwrap();
    let entry = h.registry.entry_by_id("adaptor_m").unwrap();
    assert_eq!(entry.status, "Scripted raw 10 50");

    h.wait_for_seq("adaptor_m", 50).await;
    h.wait_for_offset("adaptor_m", 20).await;
    let buffer = h.mem_buffers.get("adaptor_m").unwrap();
    wait_until("committed chunks to leave the buffer", || buffer.len() == 3).await;

    h.sink.clear();
    let restarted = restart(&h, "adaptor_m").await;
    h.wait_for_seq("adaptor_m", 50).await;

    let replayed = h.sink.received();
    assert_eq!(
        replayed.iter().map(|c| c.seq_id).collect::<Vec<_>>(),
        vec![30, 40, 50]
    );
    assert!(replayed
        .iter()
        .all(|c| c.initiator == Some(restarted.adaptor_ref)));
    assert_eq!(replayed[0].data[0], scripted_byte(20));

    h.registry
        .stop_adaptor("adaptor_m", ShutdownPolicy::Gracefully)
        .await
        .unwrap();
    assert!(h.mem_buffers.get("adaptor_m").is_none());
}

#[tokio::test]
async fn test_mem_buffer_empties_as_commits_arrive() {
    let h = Harness::new(CapturingSink::new());
    h.registry
        .process_add_command("add m = MemBuffered Scripted raw 10 40 0")
        .await
        .unwrap();
    h.wait_for_offset("adaptor_m", 40).await;
    let buffer = h.mem_buffers.get("adaptor_m").unwrap();
    wait_until("the buffer to drain", || buffer.is_empty()).await;
    h.registry.stop_all(ShutdownPolicy::HardStop).await;
}

#[tokio::test]
async fn test_writeahead_replays_from_disk_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let settings = AdaptorSettings {
        writeahead_dir: dir.path().to_path_buf(),
        ..AdaptorSettings::default()
    };
    let h = Harness::with_settings(&settings, CapturingSink::committing_up_to(20));
    h.registry
        .process_add_command("add w = WriteaheadBuffered Scripted raw 10 50 0")
        .await
        .unwrap();
    let log = WriteaheadBuffered::log_path(dir.path(), "adaptor_w");

    h.wait_for_seq("adaptor_w", 50).await;
    h.wait_for_offset("adaptor_w", 20).await;
    assert!(log.exists());

    h.sink.clear();
    let restarted = restart(&h, "adaptor_w").await;
    h.wait_for_seq("adaptor_w", 50).await;
    let replayed = h.sink.received();
    assert_eq!(
        replayed.iter().map(|c| c.seq_id).collect::<Vec<_>>(),
        vec![30, 40, 50]
    );
    assert!(replayed
        .iter()
        .all(|c| c.initiator == Some(restarted.adaptor_ref)));

    h.registry
        .stop_adaptor("adaptor_w", ShutdownPolicy::Gracefully)
        .await
        .unwrap();
    assert!(!log.exists());
}

#[tokio::test]
async fn test_writeahead_compacts_committed_records() {
    let dir = tempfile::tempdir().unwrap();
    let settings = AdaptorSettings {
        writeahead_dir: dir.path().to_path_buf(),
        writeahead_compact_at: 100,
        ..AdaptorSettings::default()
    };
    let h = Harness::with_settings(&settings, CapturingSink::new());
    h.registry
        .process_add_command("add w = WriteaheadBuffered Scripted raw 50 1000 0")
        .await
        .unwrap();
    h.wait_for_offset("adaptor_w", 1000).await;

    // Committed records stay only while their payload is within the
    // compaction threshold, so at most the last 100 bytes remain.
    let log = WriteaheadBuffered::log_path(dir.path(), "adaptor_w");
    wait_until("the log to be compacted", || {
        let bytes = std::fs::read(&log).unwrap_or_default();
        let left = decode_records(&bytes, &log);
        left.iter().map(|c| c.data.len()).sum::<usize>() <= 100
            && left.iter().all(|c| c.seq_id > 900)
    })
    .await;
    h.registry.stop_all(ShutdownPolicy::HardStop).await;
}
