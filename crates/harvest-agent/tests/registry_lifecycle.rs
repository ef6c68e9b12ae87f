// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{wait_until, Harness};
use common::mocks::{scripted_byte, CapturingSink};
use harvest_agent::adaptor::ShutdownPolicy;
use harvest_agent::errors::CommandError;
use harvest_agent::registry::AddOutcome;

#[tokio::test]
async fn test_delivered_data_is_committed() {
    let h = Harness::new(CapturingSink::new());
    let outcome = h
        .registry
        .process_add_command("add s = Scripted raw 10 45 0")
        .await
        .unwrap();
    assert_eq!(outcome, AddOutcome::Started("adaptor_s".to_string()));

    h.wait_for_offset("adaptor_s", 45).await;

    let chunks = h.sink.received_from("scripted");
    let data: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
    assert_eq!(data, (0..45).map(scripted_byte).collect::<Vec<u8>>());
    assert_eq!(
        chunks.iter().map(|c| c.seq_id).collect::<Vec<_>>(),
        vec![10, 20, 30, 40, 45]
    );
    assert!(chunks.iter().all(|c| c.source == "testhost"));
    assert!(chunks.iter().all(|c| c.tag("cluster") == Some("test")));

    assert_eq!(
        h.registry
            .stop_adaptor("adaptor_s", ShutdownPolicy::Gracefully)
            .await,
        Some(45)
    );
    assert!(h.registry.list().is_empty());
}

#[tokio::test]
async fn test_resume_offset_skips_earlier_bytes() {
    let h = Harness::new(CapturingSink::new());
    h.registry
        .process_add_command("add s = Scripted raw 10 30 17")
        .await
        .unwrap();
    h.wait_for_offset("adaptor_s", 30).await;

    let first = &h.sink.received_from("scripted")[0];
    assert_eq!(first.start_offset(), 17);
    assert_eq!(first.data[0], scripted_byte(17));
}

#[tokio::test]
async fn test_same_command_maps_to_same_id() {
    let h = Harness::new(CapturingSink::holding());
    let first = h
        .registry
        .process_add_command("add Scripted raw 10 1000 0")
        .await
        .unwrap();
    let second = h
        .registry
        .process_add_command("add Scripted raw  10  1000 500")
        .await
        .unwrap();
    let id = first.id().unwrap().to_string();
    assert!(id.starts_with("adaptor_"));
    assert_eq!(id.len(), "adaptor_".len() + 32);
    assert_eq!(second, AddOutcome::AlreadyRunning(id.clone()));
    assert_eq!(h.registry.adaptor_count(), 1);
    assert_eq!(h.registry.offset_of(&id), Some(0));
}

#[tokio::test]
async fn test_dotted_class_name_maps_to_same_id() {
    let h = Harness::new(CapturingSink::holding());
    let short = h
        .registry
        .process_add_command("add Scripted raw 10 1000 0")
        .await
        .unwrap();
    let dotted = h
        .registry
        .process_add_command("add harvest.adaptor.Scripted raw 10 1000 0")
        .await
        .unwrap();
    let id = short.id().unwrap().to_string();
    assert_eq!(dotted, AddOutcome::AlreadyRunning(id.clone()));
    assert_eq!(h.registry.adaptor_count(), 1);
    assert_eq!(h.registry.list()[&id], "Scripted raw 10 1000 0");
}

#[tokio::test]
async fn test_rejections_leave_no_state() {
    let h = Harness::new(CapturingSink::new());
    assert!(matches!(
        h.registry.process_add_command("add x = NoSuch raw 0").await,
        Err(CommandError::UnknownClass(_))
    ));
    assert!(matches!(
        h.registry
            .process_add_command("add x = Scripted raw ten 100 0")
            .await,
        Err(CommandError::InvalidParams { .. })
    ));
    assert!(matches!(
        h.registry
            .process_add_command("add x = Scripted raw 10 100 -1")
            .await,
        Err(CommandError::BadOffset(_))
    ));
    assert!(matches!(
        h.registry.process_add_command("launch Scripted").await,
        Err(CommandError::Malformed(_))
    ));
    assert_eq!(h.registry.adaptor_count(), 0);
    assert!(h.registry.entry_by_id("adaptor_x").is_none());
}

#[tokio::test]
async fn test_adaptor_can_deregister_itself() {
    let h = Harness::new(CapturingSink::new());
    h.registry
        .process_add_command("add quitter = Scripted raw 10 0 0")
        .await
        .unwrap();
    wait_until("the adaptor to deregister", || {
        h.registry.entry_by_id("adaptor_quitter").is_none()
    })
    .await;
    assert_eq!(h.registry.adaptor_count(), 0);
}

#[tokio::test]
async fn test_stop_all_and_concurrent_stops() {
    let h = Harness::new(CapturingSink::new());
    for name in ["a", "b", "c"] {
        h.registry
            .process_add_command(&format!("add {name} = Scripted raw 5 20 0"))
            .await
            .unwrap();
    }

    let (first, second) = tokio::join!(
        h.registry.stop_adaptor("adaptor_a", ShutdownPolicy::HardStop),
        h.registry.stop_adaptor("adaptor_a", ShutdownPolicy::HardStop),
    );
    assert!(first.is_some() ^ second.is_some());

    assert_eq!(h.registry.stop_all(ShutdownPolicy::HardStop).await, 2);
    assert_eq!(h.registry.adaptor_count(), 0);
}

#[tokio::test]
async fn test_commits_for_unknown_adaptor_are_ignored() {
    let h = Harness::new(CapturingSink::new());
    h.registry
        .process_add_command("add s = Scripted raw 10 20 0")
        .await
        .unwrap();
    h.wait_for_offset("adaptor_s", 20).await;
    let stale = h.registry.entry_by_id("adaptor_s").unwrap().adaptor_ref;
    h.registry
        .stop_adaptor("adaptor_s", ShutdownPolicy::HardStop)
        .await
        .unwrap();

    assert_eq!(h.registry.report_commit(stale, 99).await, None);
    assert!(h.registry.offset_of("adaptor_s").is_none());
}
