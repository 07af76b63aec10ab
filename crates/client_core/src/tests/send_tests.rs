use anyhow::anyhow;
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{LiveEventKind, PrivateMessageEmit},
};

use super::*;
use crate::test_support::{
    ids, live_event, private_message, public_message, FakeChatApi, FakeLiveConnection,
};

fn selector(
    live: &Arc<FakeLiveConnection>,
) -> (Arc<ChannelStore>, Arc<FakeChatApi>, SendPathSelector) {
    let store = Arc::new(ChannelStore::default());
    let api = FakeChatApi::new();
    let selector = SendPathSelector::new(
        Arc::clone(&store),
        api.clone() as Arc<dyn ChatApi>,
        live.clone() as Arc<dyn LiveConnection>,
    );
    (store, api, selector)
}

#[tokio::test]
async fn connected_send_emits_and_leaves_store_untouched() {
    let live = FakeLiveConnection::connected();
    let (store, api, selector) = selector(&live);
    let peer = ChannelKey::private(UserId(4));

    let outcome = selector.send(peer, "hey").await.expect("send");

    assert_eq!(outcome, SendOutcome::Emitted);
    assert_eq!(
        live.emitted(),
        vec![LiveEmit::PrivateMessage(PrivateMessageEmit {
            recipient_id: UserId(4),
            message: "hey".into(),
        })]
    );
    assert_eq!(api.send_call_count(), 0);
    assert!(store.messages(peer).is_empty());
}

#[tokio::test]
async fn offline_send_stores_server_copy_as_read() {
    let live = FakeLiveConnection::new();
    let (store, api, selector) = selector(&live);
    let created = public_message(31, 1, 0);
    api.queue_send(Ok(created.clone()));

    let outcome = selector
        .send(ChannelKey::Public, "hola")
        .await
        .expect("send");

    assert_eq!(outcome, SendOutcome::Stored(created.clone()));
    assert_eq!(store.messages(ChannelKey::Public), vec![created]);
    assert_eq!(store.unread(ChannelKey::Public), 0);
    assert!(live.emitted().is_empty());
}

#[tokio::test]
async fn failed_request_send_propagates_and_writes_nothing() {
    let live = FakeLiveConnection::new();
    let (store, api, selector) = selector(&live);
    let peer = ChannelKey::private(UserId(4));
    api.queue_send(Err(anyhow!(ApiError::new(401, "Token expirado"))));

    let err = selector.send(peer, "hola").await.expect_err("must fail");

    assert_eq!(err.channel(), Some(peer));
    assert!(err.requires_reauth());
    assert!(store.messages(peer).is_empty());
}

#[tokio::test]
async fn blank_body_is_rejected_before_any_transport() {
    let live = FakeLiveConnection::connected();
    let (_store, api, selector) = selector(&live);

    let err = selector
        .send(ChannelKey::Public, "  \n\t")
        .await
        .expect_err("must fail");

    assert!(matches!(err, ChatError::EmptyMessage));
    assert!(live.emitted().is_empty());
    assert_eq!(api.send_call_count(), 0);
}

#[tokio::test]
async fn emit_failure_falls_back_to_request_path() {
    let live = FakeLiveConnection::connected();
    *live.fail_emits.lock().expect("fail") = true;
    let (store, api, selector) = selector(&live);
    let peer = ChannelKey::private(UserId(4));
    api.queue_send(Ok(private_message(40, 1, 4, 0)));

    let outcome = selector.send(peer, "hola").await.expect("send");

    assert!(matches!(outcome, SendOutcome::Stored(_)));
    assert_eq!(api.send_call_count(), 1);
    assert_eq!(store.messages(peer).len(), 1);
}

#[tokio::test]
async fn live_echo_of_a_stored_send_is_not_duplicated() {
    let live = FakeLiveConnection::new();
    let (store, api, selector) = selector(&live);
    let peer = ChannelKey::private(UserId(4));
    let sent = private_message(40, 1, 4, 0);
    api.queue_send(Ok(sent.clone()));

    let outcome = selector.send(peer, "hola").await.expect("send");
    assert!(matches!(outcome, SendOutcome::Stored(_)));

    let echo = live_event(LiveEventKind::PrivateMessageSent, &sent);
    assert_eq!(crate::bridge::ingest(&store, UserId(1), &echo), Some(peer));

    assert_eq!(ids(&store.messages(peer)), vec![40]);
    assert_eq!(store.unread(peer), 0);
}
