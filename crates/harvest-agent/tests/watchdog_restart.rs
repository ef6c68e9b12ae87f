// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{Harness, WATCHDOG_TIMEOUT};
use common::mocks::CapturingSink;
use harvest_agent::adaptor::ShutdownPolicy;
use harvest_agent::chunk::{AdaptorRef, Chunk};
use tokio::time::Instant;
use tracing_test::traced_test;

fn after_timeout() -> Instant {
    Instant::now() + WATCHDOG_TIMEOUT * 2
}

#[tokio::test]
async fn test_stalled_adaptor_restarts_at_committed_offset() {
    let h = Harness::new(CapturingSink::committing_up_to(20));
    h.registry
        .process_add_command("add s = Scripted raw 10 50 0")
        .await
        .unwrap();
    h.wait_for_seq("adaptor_s", 50).await;
    h.wait_for_offset("adaptor_s", 20).await;
    let old = h.registry.entry_by_id("adaptor_s").unwrap().adaptor_ref;

    assert!(h.watchdog.sweep().await.is_empty());

    h.sink.clear();
    h.sink.set_commit_limit(u64::MAX);
    let restarted = h.watchdog.sweep_at(after_timeout()).await;
    assert_eq!(restarted, vec!["adaptor_s".to_string()]);

    let entry = h.registry.entry_by_id("adaptor_s").unwrap();
    assert_ne!(entry.adaptor_ref, old);
    assert_eq!(entry.status, "raw 10 50");

    h.wait_for_offset("adaptor_s", 50).await;
    let resent = h.sink.received();
    assert_eq!(resent[0].start_offset(), 20);
    assert!(resent.iter().all(|c| c.initiator == Some(entry.adaptor_ref)));

    assert!(h.watchdog.sweep().await.is_empty());
    h.registry.stop_all(ShutdownPolicy::HardStop).await;
}

#[tokio::test]
async fn test_fully_committed_adaptor_is_left_alone() {
    let h = Harness::new(CapturingSink::new());
    h.registry
        .process_add_command("add s = Scripted raw 10 30 0")
        .await
        .unwrap();
    h.wait_for_offset("adaptor_s", 30).await;
    let before = h.registry.entry_by_id("adaptor_s").unwrap().adaptor_ref;

    assert!(h.watchdog.sweep_at(after_timeout()).await.is_empty());
    assert_eq!(
        h.registry.entry_by_id("adaptor_s").unwrap().adaptor_ref,
        before
    );
    h.registry.stop_all(ShutdownPolicy::HardStop).await;
}

#[tokio::test]
#[traced_test]
async fn test_stalled_adaptor_restarts_only_once() {
    let h = Harness::new(CapturingSink::holding());
    h.registry
        .process_add_command("add s = Scripted raw 10 30 0")
        .await
        .unwrap();
    h.wait_for_seq("adaptor_s", 30).await;

    assert_eq!(h.watchdog.sweep_at(after_timeout()).await.len(), 1);
    logs_assert(|lines: &[&str]| {
        lines
            .iter()
            .find(|line| line.contains("adaptor adaptor_s sent up to 30"))
            .filter(|line| line.contains("WARN") && line.contains("restarting"))
            .map(|_| ())
            .ok_or_else(|| "no warn-level restart line".to_string())
    });
    // The fresh registration starts a new stall clock.
    assert!(h.watchdog.sweep().await.is_empty());
    assert_eq!(h.registry.adaptor_count(), 1);
    h.registry.stop_all(ShutdownPolicy::HardStop).await;
}

#[tokio::test]
async fn test_entries_for_vanished_adaptors_are_dropped() {
    let h = Harness::new(CapturingSink::holding());
    let mut orphan = Chunk::new("raw", "gone", 10, vec![0; 10]);
    orphan.initiator = Some(AdaptorRef::new(9999));
    h.watchdog.report_pending(&[orphan]);
    assert_eq!(h.watchdog.tracked(), 1);

    assert!(h.watchdog.sweep_at(after_timeout()).await.is_empty());
    assert_eq!(h.watchdog.tracked(), 0);
}
