use mima_core::{
    Action, FormKind, FormObservation, Invalidation, MatchResult, SyncConfig, TabBroadcaster,
};
use mima_protocol::{
    read_frame, write_frame, CanonicalKey, CredentialRecord, RecordId, Secret, SyncMessage,
};
use mima_protocol::MutateAction;
use mima_sync::{
    BrowsingContext, ContextError, ContextEvent, SyncBridge, SyncError, UnixConnector,
};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;

const WAIT: Duration = Duration::from_secs(5);

fn alice() -> CredentialRecord {
    CredentialRecord {
        id: Some(RecordId(1)),
        domain: "shop.example".to_string(),
        display_username: "alice".to_string(),
        canonical_key: CanonicalKey::from_normalized("shop.example", "alice"),
        password: Secret::new("p1"),
        updated_at: 1,
        ..CredentialRecord::default()
    }
}

async fn accept(listener: &UnixListener) -> (OwnedReadHalf, OwnedWriteHalf) {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("connection in time")
        .expect("accept");
    stream.into_split()
}

async fn next_request(read: &mut OwnedReadHalf) -> SyncMessage {
    read_frame(read).await.expect("read").expect("request")
}

async fn answer_query(read: &mut OwnedReadHalf, write: &mut OwnedWriteHalf) {
    let request = next_request(read).await;
    write_frame(
        write,
        &SyncMessage::QueryResult {
            correlation_id: request.correlation_id(),
            domain: request.domain().to_string(),
            records: vec![alice()],
        },
    )
    .await
    .expect("reply");
}

fn setup(timeout_ms: u64) -> (tempfile::TempDir, UnixListener, SyncBridge, SyncConfig) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("authority.sock");
    let listener = UnixListener::bind(&path).expect("bind");
    let config = SyncConfig {
        query_timeout_ms: timeout_ms,
        ..SyncConfig::default()
    };
    let bridge = SyncBridge::from_config(UnixConnector::new(&path), TabBroadcaster::default(), &config);
    (dir, listener, bridge, config)
}

#[tokio::test]
async fn lost_channel_fails_pending_and_stales_caches() {
    let (_dir, listener, bridge, config) = setup(3_000);
    let ctx = BrowsingContext::open(bridge.clone(), &config);
    let mut invalidations = bridge.broadcaster().subscribe(None);

    let (filled, mut server) = tokio::join!(ctx.autofill_ready("shop.example"), async {
        let (mut read, mut write) = accept(&listener).await;
        answer_query(&mut read, &mut write).await;
        (read, write)
    });
    assert!(matches!(filled.expect("autofill"), MatchResult::Single(_)));
    assert!(matches!(
        ctx.autofill("shop.example").await.expect("autofill"),
        MatchResult::Single(_)
    ));

    let calls: Vec<_> = ["a.example", "b.example", "c.example"]
        .into_iter()
        .map(|domain| {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.query(domain).await })
        })
        .collect();
    for _ in 0..3 {
        let _ = next_request(&mut server.0).await;
    }
    drop(server);

    for call in calls {
        assert_eq!(
            call.await.expect("join").expect_err("closed"),
            SyncError::ChannelClosed
        );
    }
    assert_eq!(invalidations.recv().await, Some(Invalidation::All));

    // Stale now, so nothing is offered until the records are reloaded.
    assert_eq!(
        ctx.autofill("shop.example").await.expect("autofill"),
        MatchResult::None
    );
    let mut server = accept(&listener).await;
    answer_query(&mut server.0, &mut server.1).await;
    let refilled = tokio::time::timeout(WAIT, ctx.autofill_ready("shop.example"))
        .await
        .expect("refill in time")
        .expect("autofill");
    assert!(matches!(refilled, MatchResult::Single(_)));
}

#[tokio::test]
async fn silent_authority_times_out() {
    let (_dir, listener, bridge, config) = setup(200);
    let ctx = BrowsingContext::open(bridge, &config);

    let (result, _server) = tokio::join!(ctx.refresh("shop.example"), async {
        let (mut read, write) = accept(&listener).await;
        let _ = next_request(&mut read).await;
        (read, write)
    });
    assert_eq!(
        result.expect_err("timeout"),
        ContextError::Sync(SyncError::Timeout(Duration::from_millis(200)))
    );
}

#[tokio::test]
async fn malformed_reply_tears_down_the_link() {
    let (_dir, listener, bridge, _config) = setup(3_000);

    let (result, _server) = tokio::join!(bridge.query("shop.example"), async {
        let (mut read, mut write) = accept(&listener).await;
        let _ = next_request(&mut read).await;
        let payload = br#"{"type":"query_result","correlationId":"one"}"#;
        let len = u32::try_from(payload.len()).expect("fits");
        write.write_all(&len.to_le_bytes()).await.expect("header");
        write.write_all(payload).await.expect("payload");
        (read, write)
    });
    assert_eq!(result.expect_err("torn down"), SyncError::ChannelClosed);
    assert!(!bridge.is_connected());
}

#[tokio::test]
async fn reply_of_the_wrong_type_tears_down_the_link() {
    let (_dir, listener, bridge, _config) = setup(3_000);
    let mut invalidations = bridge.broadcaster().subscribe(None);

    let (result, _server) = tokio::join!(bridge.query("shop.example"), async {
        let (mut read, mut write) = accept(&listener).await;
        let request = next_request(&mut read).await;
        write_frame(
            &mut write,
            &SyncMessage::MutateResult {
                correlation_id: request.correlation_id(),
                domain: "shop.example".to_string(),
                record: alice(),
            },
        )
        .await
        .expect("reply");
        (read, write)
    });
    assert_eq!(
        result.expect_err("mismatched reply"),
        SyncError::MalformedMessage("expected query_result, got mutate_result".to_string())
    );
    assert!(!bridge.is_connected());
    assert_eq!(invalidations.try_recv(), Some(Invalidation::All));

    // The next call reconnects.
    let (result, _server) = tokio::join!(bridge.query("shop.example"), async {
        let (mut read, mut write) = accept(&listener).await;
        answer_query(&mut read, &mut write).await;
        (read, write)
    });
    assert_eq!(result.expect("query").len(), 1);
}

/// Nothing else arrives on the connection for a while.
async fn assert_quiet(read: &mut OwnedReadHalf) {
    let extra = tokio::time::timeout(Duration::from_millis(300), read_frame(read)).await;
    assert!(extra.is_err(), "unexpected frame: {extra:?}");
}

#[tokio::test]
async fn rapid_submissions_are_saved_once() {
    let (_dir, listener, bridge, config) = setup(3_000);
    let config = SyncConfig {
        settle_window_ms: 50,
        ..config
    };
    let mut ctx = BrowsingContext::open(bridge, &config);

    for password in ["p2", "p3"] {
        ctx.observe(FormObservation::new(
            "shop.example",
            "alice",
            password,
            FormKind::Login,
        ))
        .await
        .expect("observe");
    }

    let (mut read, mut write) = accept(&listener).await;
    answer_query(&mut read, &mut write).await;
    let SyncMessage::Mutate {
        correlation_id,
        action,
        record,
        ..
    } = next_request(&mut read).await
    else {
        panic!("expected a mutate request");
    };
    assert_eq!(action, MutateAction::UpdatePassword);
    assert_eq!(record.password.expose(), "p3");
    write_frame(
        &mut write,
        &SyncMessage::MutateResult {
            correlation_id,
            domain: "shop.example".to_string(),
            record,
        },
    )
    .await
    .expect("reply");

    let classified = tokio::time::timeout(WAIT, ctx.next_event())
        .await
        .expect("classified in time");
    assert!(matches!(
        classified,
        Some(ContextEvent::Classified {
            action: Action::UpdatePassword { .. },
            ..
        })
    ));
    let saved = tokio::time::timeout(WAIT, ctx.next_event())
        .await
        .expect("saved in time");
    assert!(matches!(
        saved,
        Some(ContextEvent::Saved {
            action: MutateAction::UpdatePassword,
            ..
        })
    ));

    assert_quiet(&mut read).await;
    assert!(ctx.try_next_event().is_none());
}

#[tokio::test]
async fn concurrent_autofills_share_one_query() {
    let (_dir, listener, bridge, config) = setup(3_000);
    let ctx = BrowsingContext::open(bridge, &config);

    let (a, b, c, d, mut server) = tokio::join!(
        ctx.autofill_ready("shop.example"),
        ctx.autofill_ready("https://shop.example/login"),
        ctx.autofill_ready("SHOP.example"),
        ctx.autofill_ready("www.shop.example"),
        async {
            let (mut read, mut write) = accept(&listener).await;
            answer_query(&mut read, &mut write).await;
            (read, write)
        }
    );
    for result in [a, b, c, d] {
        assert!(matches!(result.expect("autofill"), MatchResult::Single(_)));
    }
    assert_quiet(&mut server.0).await;
}

#[tokio::test]
async fn unsolicited_invalidate_reaches_subscribers() {
    let (_dir, listener, bridge, _config) = setup(3_000);
    let mut shop = bridge.broadcaster().subscribe(Some("shop.example"));

    let (result, mut server) = tokio::join!(bridge.query("shop.example"), async {
        let (mut read, mut write) = accept(&listener).await;
        answer_query(&mut read, &mut write).await;
        (read, write)
    });
    assert_eq!(result.expect("query").len(), 1);

    write_frame(&mut server.1, &SyncMessage::invalidate("other.example"))
        .await
        .expect("push");
    write_frame(&mut server.1, &SyncMessage::invalidate("SHOP.example"))
        .await
        .expect("push");
    let received = tokio::time::timeout(WAIT, shop.recv())
        .await
        .expect("in time");
    assert_eq!(
        received,
        Some(Invalidation::Domain("shop.example".to_string()))
    );
}
