//! Integration tests for serialized sends and session failover.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{CourierConfig, CourierError, FailoverPolicy, Result, SendReceipt, SessionState};
use tokio::task::JoinHandle;
use tokio::time::Instant;

mod common;

use common::{build_core, config, settle, start_core, TestCore, PEER, PEER_CHAT};

fn spawn_send(core: &TestCore, body: &str) -> JoinHandle<Result<SendReceipt>> {
    let messenger = Arc::clone(&core.ctx.messenger);
    let body = body.to_string();
    tokio::spawn(async move { messenger.send_text(PEER, &body).await })
}

fn sent_bodies(core: &TestCore, index: usize) -> Vec<String> {
    core.provider.sessions()[index]
        .sent()
        .into_iter()
        .map(|record| record.content.summary())
        .collect()
}

// ============================================================================
// Sends
// ============================================================================

#[tokio::test]
async fn test_send_text_returns_formatted_receipt() {
    let core = start_core(config(&["5491100000000"])).await;
    core.provider.queue_message_ids(["ABC"]);
    core.provider.script(|s| s.timestamp = Some(1_700_000_000));

    let receipt = core.ctx.messenger.send_text(PEER, "hola").await.unwrap();

    assert_eq!(
        receipt,
        SendReceipt {
            id: "ABC".to_string(),
            ack: 1,
            from: "5491100000000".to_string(),
            to: PEER.to_string(),
            time: "2023-11-14 22:13:20".to_string(),
        }
    );
    assert_eq!(sent_bodies(&core, 0), vec!["hola"]);
}

#[tokio::test]
async fn test_send_file_defaults_mime_type() {
    let core = start_core(config(&["a"])).await;

    core.ctx
        .messenger
        .send_file(PEER, vec![1, 2, 3], None, Some("a.bin".to_string()), None)
        .await
        .unwrap();

    assert_eq!(
        sent_bodies(&core, 0),
        vec!["[media application/octet-stream 3 bytes a.bin]"]
    );
}

#[tokio::test]
async fn test_send_location_sends_map_link() {
    let core = start_core(config(&["a"])).await;

    core.ctx
        .messenger
        .send_location(PEER, -34.6, -58.38, Some("Obelisco"))
        .await
        .unwrap();

    assert_eq!(
        sent_bodies(&core, 0),
        vec!["Obelisco\nhttps://maps.google.com/?q=-34.6,-58.38"]
    );
}

#[tokio::test]
async fn test_invalid_input_is_never_enqueued() {
    let core = start_core(config(&["a"])).await;
    let messenger = &core.ctx.messenger;

    let errors = vec![
        messenger.send_text("", "hola").await.unwrap_err(),
        messenger.send_text("12ab", "hola").await.unwrap_err(),
        messenger.send_text(PEER, "   ").await.unwrap_err(),
        messenger.send_file(PEER, vec![], None, None, None).await.unwrap_err(),
        messenger
            .send_location(PEER, 91.0, 0.0, None)
            .await
            .unwrap_err(),
        messenger.recent_messages(PEER, Some(0)).await.unwrap_err(),
        messenger.recent_messages(PEER, Some(101)).await.unwrap_err(),
    ];

    for err in errors {
        assert_eq!(err.kind(), "validation_error", "{err}");
    }
    assert!(core.session().sent().is_empty());
    assert_eq!(core.provider.sessions().len(), 1);
    assert_eq!(messenger.health().queued_jobs, 0);
}

#[tokio::test]
async fn test_recent_messages_returns_conversation_tail() {
    let core = start_core(config(&["a"])).await;
    for body in ["1", "2"] {
        core.ctx.messenger.send_text(PEER, body).await.unwrap();
    }
    core.session().receive(PEER_CHAT, "3");

    let messages = core
        .ctx
        .messenger
        .recent_messages(PEER, Some(2))
        .await
        .unwrap();

    let bodies: Vec<_> = messages.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["2", "3"]);
    assert!(messages[0].from_me);
    assert!(!messages[1].from_me);
}

// ============================================================================
// Queue ordering and budgets
// ============================================================================

#[tokio::test]
async fn test_concurrent_sends_complete_in_submission_order() {
    let core = start_core(config(&["a"])).await;
    let ids: Vec<String> = (0..10).map(|i| format!("id-{i}")).collect();
    core.provider.queue_message_ids(ids.clone());

    let handles: Vec<_> = (0..10).map(|i| spawn_send(&core, &i.to_string())).collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap().id, ids[i]);
    }
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(sent_bodies(&core, 0), expected);
}

#[tokio::test(start_paused = true)]
async fn test_hung_send_times_out_and_next_send_still_runs() {
    let core = start_core(CourierConfig {
        job_timeout_secs: 30,
        ..config(&["a", "b"])
    })
    .await;
    core.wait_ready().await;
    core.provider.hang_next_sends(1);
    let started = Instant::now();

    let hung = spawn_send(&core, "hung");
    let next = spawn_send(&core, "next");

    let err = hung.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(started.elapsed(), Duration::from_secs(30));

    let receipt = next.await.unwrap().unwrap();
    assert_eq!(receipt.from, "a");
    // Timeouts alone never replace the session under the default policy.
    assert_eq!(core.provider.sessions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_over_under_any_failure_policy() {
    let core = start_core(CourierConfig {
        job_timeout_secs: 30,
        failover_policy: FailoverPolicy::AnyFailure,
        ..config(&["a", "b"])
    })
    .await;
    core.wait_ready().await;
    core.provider.hang_next_sends(1);

    let err = core.ctx.messenger.send_text(PEER, "hung").await.unwrap_err();
    assert!(err.is_timeout());
    settle().await;

    let receipt = core.ctx.messenger.send_text(PEER, "next").await.unwrap();
    assert_eq!(receipt.from, "b");
    assert_eq!(core.provider.sessions().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_send_before_any_session_times_out_at_readiness_gate() {
    let core = build_core(CourierConfig {
        job_timeout_secs: 120,
        ..config(&["a"])
    });
    let started = Instant::now();

    let err = core.ctx.messenger.send_text(PEER, "hola").await.unwrap_err();

    assert!(matches!(err, CourierError::Timeout(_)));
    assert_eq!(started.elapsed(), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_job_timed_out_at_gate_never_sends_once_session_is_ready() {
    let core = start_core(CourierConfig {
        job_timeout_secs: 30,
        ..config(&["a", "b"])
    })
    .await;
    core.wait_ready().await;
    core.provider.script(|s| s.auto_ready = false);
    core.ctx.sessions.failover().await.unwrap();
    let started = Instant::now();

    let first = spawn_send(&core, "first");
    let second = spawn_send(&core, "second");

    let err = first.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(started.elapsed(), Duration::from_secs(30));

    core.session().become_ready();
    let receipt = second.await.unwrap().unwrap();
    assert_eq!(receipt.from, "b");
    settle().await;

    assert!(sent_bodies(&core, 0).is_empty());
    assert_eq!(sent_bodies(&core, 1), vec!["second"]);
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test]
async fn test_faulted_send_fails_caller_and_next_job_runs_on_replacement() {
    let core = start_core(config(&["a", "b"])).await;
    core.wait_ready().await;
    core.provider.fail_next_sends(1);

    let failing = spawn_send(&core, "first");
    let following = spawn_send(&core, "second");

    let err = failing.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "session_fault");

    let receipt = following.await.unwrap().unwrap();
    assert_eq!(receipt.from, "b");

    // The failed job was not retried anywhere.
    assert!(sent_bodies(&core, 0).is_empty());
    assert_eq!(sent_bodies(&core, 1), vec!["second"]);
    assert!(core.provider.sessions()[0].is_destroyed());
}

#[tokio::test]
async fn test_one_fault_causes_one_swap() {
    let core = start_core(config(&["a", "b", "c"])).await;
    core.wait_ready().await;
    core.provider.fail_next_sends(1);

    let _ = core.ctx.messenger.send_text(PEER, "boom").await;
    // A disconnect reported by the same, already faulted session.
    core.provider.sessions()[0].disconnect("CONFLICT");
    settle().await;
    core.wait_ready().await;

    assert_eq!(core.provider.sessions().len(), 2);
    assert_eq!(core.ctx.sessions.generation(), 2);
}

#[tokio::test]
async fn test_disconnect_moves_later_sends_to_next_identity() {
    let core = start_core(config(&["a", "b"])).await;
    let first = core.ctx.messenger.send_text(PEER, "before").await.unwrap();

    core.session().disconnect("NAVIGATION");
    settle().await;
    let second = core.ctx.messenger.send_text(PEER, "after").await.unwrap();

    assert_eq!(first.from, "a");
    assert_eq!(second.from, "b");
}

#[tokio::test]
async fn test_pool_wraps_after_last_identity() {
    let core = start_core(config(&["a", "b"])).await;

    core.ctx.sessions.failover().await.unwrap();
    core.ctx.sessions.failover().await.unwrap();
    core.wait_ready().await;

    let receipt = core.ctx.messenger.send_text(PEER, "hola").await.unwrap();
    assert_eq!(receipt.from, "a");
    assert_eq!(core.ctx.sessions.generation(), 3);
}

// ============================================================================
// Health and audit
// ============================================================================

#[tokio::test]
async fn test_health_reports_ready_session() {
    let core = start_core(config(&["a"])).await;
    core.wait_ready().await;

    let health = core.ctx.messenger.health();

    assert!(health.ready);
    assert_eq!(health.state, SessionState::Ready);
    assert_eq!(health.identity.as_deref(), Some("a"));
    assert_eq!(health.generation, 1);
    assert!(!health.qr_pending);
}

#[tokio::test]
async fn test_health_while_waiting_for_qr_scan() {
    let core = build_core(config(&["a"]));
    core.provider.script(|s| s.auto_ready = false);
    core.ctx.start().await;
    settle().await;

    let health = core.ctx.messenger.health();

    assert!(!health.ready);
    assert_eq!(health.state, SessionState::Connecting);
    assert!(health.qr_pending);
}

#[tokio::test]
async fn test_audit_log_records_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let core = start_core(CourierConfig {
        log_dir: Some(dir.path().to_path_buf()),
        ..config(&["a"])
    })
    .await;

    core.ctx.messenger.send_text(PEER, "ping").await.unwrap();
    core.session().receive(PEER_CHAT, "pong");
    settle().await;

    let contents = std::fs::read_to_string(dir.path().join("courier.log")).unwrap();
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with(&format!("OUT {PEER_CHAT}: ping")));
    assert!(lines[1].ends_with(&format!("IN {PEER_CHAT}: pong")));
}
