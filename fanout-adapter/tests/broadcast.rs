//! Cross-instance broadcast fan-out.

mod common;

use std::collections::BTreeSet;

use serde_json::json;

use common::{cluster, cluster_with, quiet_config, settle};
use fanout_core::{BroadcastOptions, Packet, SocketHost};

#[tokio::test]
async fn broadcast_reaches_every_instance_exactly_once() {
    let cluster = cluster(3).await;
    let a = cluster.instance(0);
    let b = cluster.instance(1);
    let c = cluster.instance(2);

    let on_a = a.host.connect("a1");
    let on_b = b.host.connect("b1");
    let on_c = c.host.connect("c1");

    a.adapter
        .broadcast(Packet::from(json!(["hello"])), BroadcastOptions::new())
        .await
        .unwrap();
    settle().await;

    assert_eq!(a.host.sent_to(&on_a).len(), 1, "local copy, not doubled");
    assert_eq!(b.host.sent_to(&on_b).len(), 1);
    assert_eq!(c.host.sent_to(&on_c).len(), 1);

    cluster.close().await;
}

#[tokio::test]
async fn room_routing_applies_on_every_instance() {
    let cluster = cluster(2).await;
    let a = cluster.instance(0);
    let b = cluster.instance(1);

    let in_room = b.host.connect("b1");
    let outside = b.host.connect("b2");
    b.host
        .add_all(&in_room, &BTreeSet::from(["room1".to_string()]));

    a.adapter
        .broadcast(
            Packet::from(json!(["scoped"])),
            BroadcastOptions::new().to("room1"),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(b.host.sent_to(&in_room).len(), 1);
    assert!(b.host.sent_to(&outside).is_empty());

    cluster.close().await;
}

#[tokio::test]
async fn except_rooms_are_excluded_remotely() {
    let cluster = cluster(2).await;
    let a = cluster.instance(0);
    let b = cluster.instance(1);

    let plain = b.host.connect("b1");
    let muted = b.host.connect("b2");
    b.host
        .add_all(&muted, &BTreeSet::from(["muted".to_string()]));

    a.adapter
        .broadcast(
            Packet::from(json!(["ev"])),
            BroadcastOptions::new().except("muted"),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(b.host.sent_to(&plain).len(), 1);
    assert!(b.host.sent_to(&muted).is_empty());

    cluster.close().await;
}

#[tokio::test]
async fn local_flag_never_leaves_the_instance() {
    let cluster = cluster_with(2, quiet_config).await;
    let a = cluster.instance(0);
    let b = cluster.instance(1);

    let on_a = a.host.connect("a1");
    let on_b = b.host.connect("b1");
    let before = cluster.store.len().await;

    a.adapter
        .broadcast(
            Packet::from(json!(["private"])),
            BroadcastOptions::new().local(),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(cluster.store.len().await, before, "no record inserted");
    assert_eq!(a.host.sent_to(&on_a).len(), 1);
    assert!(b.host.sent_to(&on_b).is_empty());

    cluster.close().await;
}

#[tokio::test]
async fn broadcasts_are_scoped_to_their_namespace() {
    let cluster = cluster(2).await;
    let a = cluster.instance(0);
    let b = cluster.instance(1);

    // A second namespace on the same shared stream.
    let foo_host = std::sync::Arc::new(fanout_core::MockHost::new());
    let foo = fanout_adapter::Adapter::new(
        cluster.store.clone(),
        foo_host.clone(),
        "/foo",
        common::test_config(),
    );
    foo.init().await.unwrap();

    let on_b = b.host.connect("b1");
    let on_foo = foo_host.connect("f1");

    a.adapter
        .broadcast(Packet::from(json!(["main-nsp"])), BroadcastOptions::new())
        .await
        .unwrap();
    settle().await;

    assert_eq!(b.host.sent_to(&on_b).len(), 1);
    assert!(foo_host.sent_to(&on_foo).is_empty(), "other namespace untouched");

    foo.close().await;
    cluster.close().await;
}

#[tokio::test]
async fn per_instance_delivery_preserves_publish_order() {
    let cluster = cluster(2).await;
    let a = cluster.instance(0);
    let b = cluster.instance(1);
    let on_b = b.host.connect("b1");

    for i in 0..10 {
        a.adapter
            .broadcast(Packet::from(json!([i])), BroadcastOptions::new())
            .await
            .unwrap();
    }
    settle().await;

    let received: Vec<_> = b.host.sent_to(&on_b);
    let order: Vec<i64> = received
        .iter()
        .map(|p| p.payload()[0].as_i64().unwrap())
        .collect();
    assert_eq!(order, (0..10).collect::<Vec<i64>>());

    cluster.close().await;
}
