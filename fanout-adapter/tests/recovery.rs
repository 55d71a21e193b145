//! Connection-state recovery across the cluster.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use common::{cluster, settle, test_config};
use fanout_adapter::{Adapter, AdapterError};
use fanout_core::{BroadcastOptions, MockHost, Packet, SocketHost};
use fanout_stream::{CappedMemoryLog, EventLog};

#[tokio::test]
async fn session_restores_on_the_same_instance() {
    let cluster = cluster(3).await;
    let a = cluster.instance(0);

    let sid = a.host.connect("c1");
    let session = a.adapter.create_session(sid.clone()).await.unwrap();
    let offset = session.last_offset.to_string();

    // Abrupt transport loss.
    a.adapter.persist_session(&sid).await.unwrap();
    a.host.disconnect(&sid, false).unwrap();

    // Reconnect within the grace window, same instance.
    a.host.connect("c1");
    let restored = a.adapter.restore_session(session.pid, &offset).await.unwrap();

    assert_eq!(restored.sid, sid, "same session id as the initial one");
    assert_eq!(restored.pid, session.pid);
    assert!(a.host.sent_to(&sid).is_empty(), "no missed broadcasts");

    cluster.close().await;
}

#[tokio::test]
async fn missed_broadcasts_replay_in_order_on_another_instance() {
    let cluster = cluster(3).await;
    let a = cluster.instance(0);
    let b = cluster.instance(1);

    // A namespace `/foo` adapter sharing the stream, to prove namespace
    // isolation of the replay.
    let foo_host = Arc::new(MockHost::new());
    let foo = Adapter::new(cluster.store.clone(), foo_host.clone(), "/foo", test_config());
    foo.init().await.unwrap();

    let sid = a.host.connect("c1");
    a.host
        .add_all(&sid, &BTreeSet::from(["room1".to_string()]));
    let session = a.adapter.create_session(sid.clone()).await.unwrap();
    let offset = session.last_offset.to_string();

    a.adapter.persist_session(&sid).await.unwrap();
    a.host.disconnect(&sid, false).unwrap();

    // While the client is away, the cluster keeps emitting.
    let emit = |packet: serde_json::Value, opts: BroadcastOptions| {
        let adapter = a.adapter.clone();
        async move { adapter.broadcast(Packet::from(packet), opts).await.unwrap() }
    };
    emit(json!([1]), BroadcastOptions::new().to(sid.room())).await;
    emit(json!([2]), BroadcastOptions::new()).await;
    emit(json!([3]), BroadcastOptions::new().to("room1")).await;
    emit(json!([4]), BroadcastOptions::new().to("room2")).await;
    emit(json!([5]), BroadcastOptions::new().except("room1")).await;
    foo.broadcast(Packet::from(json!([6])), BroadcastOptions::new())
        .await
        .unwrap();
    settle().await;

    // Reconnect through a different instance.
    b.host.connect("c1");
    let restored = b
        .adapter
        .restore_session(session.pid, &offset)
        .await
        .unwrap();

    assert_eq!(restored.sid, sid);
    assert!(
        b.host.socket_rooms(&sid).unwrap().contains("room1"),
        "rooms re-joined before replay"
    );

    let replayed: Vec<i64> = b
        .host
        .sent_to(&sid)
        .iter()
        .map(|p| p.payload()[0].as_i64().unwrap())
        .collect();
    assert_eq!(replayed, vec![1, 2, 3]);

    foo.close().await;
    cluster.close().await;
}

#[tokio::test]
async fn unknown_private_id_is_refused() {
    let cluster = cluster(2).await;
    let a = cluster.instance(0);

    a.host.connect("c1");
    let err = a
        .adapter
        .restore_session(Uuid::new_v4(), "1")
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::SessionUnknown));

    cluster.close().await;
}

#[tokio::test]
async fn garbage_offset_is_refused() {
    let cluster = cluster(2).await;
    let a = cluster.instance(0);

    let sid = a.host.connect("c1");
    let session = a.adapter.create_session(sid.clone()).await.unwrap();
    a.adapter.persist_session(&sid).await.unwrap();

    let err = a
        .adapter
        .restore_session(session.pid, "abc")
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::OffsetInvalid(_)));

    cluster.close().await;
}

#[tokio::test]
async fn offset_older_than_retention_is_refused() {
    // A tiny capped store: the session's offset is evicted while the
    // client is away.
    let store: Arc<CappedMemoryLog<serde_json::Value>> = Arc::new(CappedMemoryLog::new(4));
    let host = Arc::new(MockHost::new());
    let adapter = Adapter::new(store.clone(), host.clone(), "/", test_config());
    adapter.init().await.unwrap();

    let sid = host.connect("c1");
    let session = adapter.create_session(sid.clone()).await.unwrap();
    let offset = session.last_offset.to_string();
    adapter.persist_session(&sid).await.unwrap();
    host.disconnect(&sid, false).unwrap();

    for i in 0..8 {
        adapter
            .broadcast(Packet::from(json!([i])), BroadcastOptions::new())
            .await
            .unwrap();
    }
    settle().await;

    host.connect("c1");
    let err = adapter
        .restore_session(session.pid, &offset)
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::OffsetInvalid(_)));

    adapter.close().await;
}

#[tokio::test]
async fn expired_session_is_refused() {
    let config = || test_config().with_max_disconnection_duration(std::time::Duration::from_millis(50));
    let cluster = common::cluster_with(2, config).await;
    let a = cluster.instance(0);

    let sid = a.host.connect("c1");
    let session = a.adapter.create_session(sid.clone()).await.unwrap();
    let offset = session.last_offset.to_string();
    a.adapter.persist_session(&sid).await.unwrap();
    a.host.disconnect(&sid, false).unwrap();

    // Let the grace window elapse.
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;

    a.host.connect("c1");
    let err = a
        .adapter
        .restore_session(session.pid, &offset)
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::SessionUnknown));

    cluster.close().await;
}

#[tokio::test]
async fn clean_disconnect_destroys_the_session() {
    let cluster = cluster(2).await;
    let a = cluster.instance(0);

    let sid = a.host.connect("c1");
    let session = a.adapter.create_session(sid.clone()).await.unwrap();
    let offset = session.last_offset.to_string();

    a.adapter.forget_session(&sid);
    a.host.disconnect(&sid, true).unwrap();

    a.host.connect("c1");
    let err = a
        .adapter
        .restore_session(session.pid, &offset)
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::SessionUnknown));

    cluster.close().await;
}

#[tokio::test]
async fn volatile_broadcasts_are_not_replayed() {
    let cluster = cluster(2).await;
    let a = cluster.instance(0);

    let sid = a.host.connect("c1");
    let session = a.adapter.create_session(sid.clone()).await.unwrap();
    let offset = session.last_offset.to_string();
    a.adapter.persist_session(&sid).await.unwrap();
    a.host.disconnect(&sid, false).unwrap();

    a.adapter
        .broadcast(
            Packet::from(json!(["gone"])),
            BroadcastOptions::new().volatile(),
        )
        .await
        .unwrap();
    a.adapter
        .broadcast(Packet::from(json!(["kept"])), BroadcastOptions::new())
        .await
        .unwrap();
    settle().await;

    a.host.connect("c1");
    a.adapter.restore_session(session.pid, &offset).await.unwrap();

    let replayed: Vec<_> = a
        .host
        .sent_to(&sid)
        .iter()
        .map(|p| p.payload()[0].clone())
        .collect();
    assert_eq!(replayed, vec![json!("kept")]);

    cluster.close().await;
}

#[tokio::test]
async fn reconnect_from_the_live_offset_replays_nothing() {
    let cluster = cluster(2).await;
    let a = cluster.instance(0);
    let b = cluster.instance(1);

    let sid = a.host.connect("c1");
    let session = a.adapter.create_session(sid.clone()).await.unwrap();

    b.adapter
        .broadcast(Packet::from(json!(["ev"])), BroadcastOptions::new())
        .await
        .unwrap();
    settle().await;
    assert_eq!(a.host.sent_to(&sid).len(), 1, "delivered live");

    // Abrupt loss after the live delivery; the client presents the
    // offset it followed the stream to.
    let offset = cluster.store.latest().await.unwrap().unwrap().to_string();
    a.adapter.persist_session(&sid).await.unwrap();
    a.host.disconnect(&sid, false).unwrap();

    a.host.connect("c1");
    a.adapter
        .restore_session(session.pid, &offset)
        .await
        .unwrap();
    assert_eq!(a.host.sent_to(&sid).len(), 1, "nothing replayed");

    cluster.close().await;
}
