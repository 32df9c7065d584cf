//! Gateway integration tests with real client connections.

mod common;

use bytes::Bytes;
use common::{eventually, gateway_config, receive, FailingCodec, RECEIVE_TIMEOUT, UNSERIALIZABLE};
use silo_config::defaults::messaging::MAX_FRAME_SIZE;
use silo_network::{GatewayClient, MessageCenter, MessageCenterBuilder, StaticDirectory};
use silo_types::{Category, Direction, GrainId, GrainKind, Message, RejectionType, ResponseType};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

async fn connect(center: &Arc<MessageCenter>, id: Uuid) -> GatewayClient {
    let mode = center.framing_mode();
    let addr = center.gateway_address().expect("gateway enabled");
    GatewayClient::connect(addr, id, mode, MAX_FRAME_SIZE).await.unwrap()
}

async fn client_recv(client: &mut GatewayClient) -> Message {
    tokio::time::timeout(RECEIVE_TIMEOUT, client.recv())
        .await
        .expect("timed out waiting for the gateway")
        .unwrap()
        .expect("gateway closed the connection")
}

#[test_log::test(tokio::test)]
async fn test_client_request_is_routed_and_answered() {
    let directory = Arc::new(StaticDirectory::new());
    let center = MessageCenterBuilder::new(gateway_config("gw"))
        .directory(directory.clone())
        .build()
        .await
        .unwrap();
    center.start().unwrap();

    let grain = GrainId::random(GrainKind::Grain);
    directory.register(grain, center.my_address());

    let mut client = connect(&center, Uuid::new_v4()).await;
    let request = Message::new(Category::Application, Direction::Request)
        .with_sender(None, client.client_id())
        .with_target(None, grain)
        .with_body(vec![Bytes::from_static(b"question")]);
    client.send(&request).await.unwrap();

    let received = receive(&center, Category::Application).await;
    assert_eq!(received.id, request.id);
    assert_eq!(received.sending_silo, Some(center.my_address()));
    assert_eq!(received.target_silo, Some(center.my_address()));

    let response = received
        .create_response()
        .with_body(vec![Bytes::from_static(b"answer")]);
    center.send_message(response);

    let reply = client_recv(&mut client).await;
    assert_eq!(reply.id, request.id);
    assert_eq!(reply.direction, Direction::Response);
    assert_eq!(reply.target_silo, None);
    assert_eq!(reply.sending_silo, Some(center.my_address().without_generation()));
    assert_eq!(reply.body(), &[Bytes::from_static(b"answer")]);
    assert_eq!(center.stats_snapshot().gateway_routed, 1);

    center.stop().await;
}

#[tokio::test]
async fn test_overloaded_gateway_sheds_requests() {
    let center = MessageCenterBuilder::new(gateway_config("shed"))
        .build()
        .await
        .unwrap();
    center.start().unwrap();
    center.set_overloaded(true);

    let mut client = connect(&center, Uuid::new_v4()).await;
    let request = Message::new(Category::Application, Direction::Request)
        .with_sender(None, client.client_id())
        .with_target(None, GrainId::random(GrainKind::Grain));
    client.send(&request).await.unwrap();

    let reply = client_recv(&mut client).await;
    assert_eq!(reply.id, request.id);
    assert_eq!(reply.rejection.unwrap().kind, RejectionType::GatewayTooBusy);
    assert_eq!(center.inbound_count(), 0);
    assert_eq!(center.stats_snapshot().load_shed, 1);

    center.stop().await;
}

#[tokio::test]
async fn test_client_ping_is_answered_by_gateway() {
    let center = MessageCenterBuilder::new(gateway_config("client-ping"))
        .build()
        .await
        .unwrap();
    center.start().unwrap();

    let mut client = connect(&center, Uuid::new_v4()).await;
    let mut ping = Message::ping(center.my_address(), center.my_address());
    ping.sending_silo = None;
    client.send(&ping).await.unwrap();

    let reply = client_recv(&mut client).await;
    assert_eq!(reply.id, ping.id);
    assert_eq!(reply.direction, Direction::Response);
    assert_eq!(reply.target_grain, Some(client.client_id()));
    assert_eq!(center.inbound_count(), 0);

    center.stop().await;
}

#[tokio::test]
async fn test_unplaceable_client_request_is_rejected() {
    let center = MessageCenterBuilder::new(gateway_config("unplaced"))
        .build()
        .await
        .unwrap();
    center.start().unwrap();

    let mut client = connect(&center, Uuid::new_v4()).await;
    let request = Message::new(Category::Application, Direction::Request)
        .with_sender(None, client.client_id())
        .with_target(None, GrainId::random(GrainKind::Grain));
    client.send(&request).await.unwrap();

    // The rejection lands in the inbound queue addressed to the client;
    // handing it back out delivers it through the gateway.
    let rejection = receive(&center, Category::Application).await;
    assert_eq!(rejection.rejection.as_ref().unwrap().kind, RejectionType::FutureTransient);
    assert_eq!(rejection.target_grain, Some(client.client_id()));
    center.send_message(rejection);

    let reply = client_recv(&mut client).await;
    assert!(reply.is_rejection());
    assert_eq!(reply.id, request.id);

    center.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_messages_for_disconnected_client_arrive_after_reconnect() {
    let center = MessageCenterBuilder::new(gateway_config("reconnect"))
        .build()
        .await
        .unwrap();
    center.start().unwrap();
    let gateway = center.gateway().unwrap();

    let id = Uuid::new_v4();
    let client_grain = GrainId::client(id);
    let observer = GrainId::random(GrainKind::ClientAddressableObject);

    let mut client = connect(&center, id).await;
    let hello = Message::new(Category::Application, Direction::OneWay)
        .with_sender(None, observer)
        .with_target(Some(center.my_address()), GrainId::random(GrainKind::SystemTarget));
    client.send(&hello).await.unwrap();
    receive(&center, Category::Application).await;
    assert!(gateway.is_proxying(&observer));

    client.close().await;
    assert!(eventually(|| gateway.client(&client_grain).map_or(false, |c| !c.is_connected())).await);

    let mut sent = Vec::new();
    for i in 0..3u8 {
        let msg = Message::new(Category::Application, Direction::OneWay)
            .with_target(Some(center.my_address()), observer)
            .with_body(vec![Bytes::from(vec![i])]);
        sent.push(msg.id);
        center.send_message(msg);
    }
    assert!(eventually(|| gateway.client(&client_grain).map_or(0, |c| c.pending_count()) == 3).await);

    let mut client = connect(&center, id).await;
    for expected in sent {
        let msg = client_recv(&mut client).await;
        assert_eq!(msg.id, expected);
        assert_eq!(msg.target_grain, Some(observer));
    }
    assert_eq!(gateway.client_count(), 1);

    center.stop().await;
}

#[tokio::test]
async fn test_dropped_client_has_no_route() {
    let center = MessageCenterBuilder::new(gateway_config("drop"))
        .build()
        .await
        .unwrap();
    center.start().unwrap();
    let gateway = center.gateway().unwrap();

    let dropped = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = dropped.clone();
    center.set_client_drop_hook(Arc::new(move |client, grains| {
        seen.lock().push((client, grains));
    }));

    let id = Uuid::new_v4();
    let client_grain = GrainId::client(id);
    let client = connect(&center, id).await;
    assert!(eventually(|| gateway.client(&client_grain).is_some()).await);
    client.close().await;
    assert!(eventually(|| gateway.client(&client_grain).map_or(false, |c| !c.is_connected())).await);

    let later = Instant::now() + center.messaging_config().client_drop_timeout() + Duration::from_secs(1);
    assert_eq!(gateway.drop_disconnected_clients(later), vec![client_grain]);
    assert_eq!(gateway.client_count(), 0);
    assert_eq!(dropped.lock().len(), 1);
    assert_eq!(dropped.lock()[0].0, client_grain);

    let msg = Message::new(Category::Application, Direction::Request)
        .with_sender(None, GrainId::random(GrainKind::Grain))
        .with_target(Some(center.my_address()), client_grain);
    center.send_message(msg);

    let rejection = receive(&center, Category::Application).await;
    assert!(rejection.rejection.unwrap().info.contains("No route to client"));
    assert_eq!(center.stats_snapshot().clients_dropped, 1);

    center.stop().await;
}

#[tokio::test]
async fn test_observer_of_dropped_client_has_no_route() {
    let center = MessageCenterBuilder::new(gateway_config("drop-observer"))
        .build()
        .await
        .unwrap();
    center.start().unwrap();
    let gateway = center.gateway().unwrap();

    let id = Uuid::new_v4();
    let client_grain = GrainId::client(id);
    let observer = GrainId::random(GrainKind::ClientAddressableObject);
    let client = connect(&center, id).await;
    assert!(eventually(|| gateway.client(&client_grain).is_some()).await);
    gateway.record_proxied_grain(observer, &client_grain);
    assert!(gateway.is_proxying(&observer));

    client.close().await;
    assert!(eventually(|| gateway.client(&client_grain).map_or(false, |c| !c.is_connected())).await);
    let later = Instant::now() + center.messaging_config().client_drop_timeout() + Duration::from_secs(1);
    assert_eq!(gateway.drop_disconnected_clients(later), vec![client_grain]);
    assert!(!gateway.is_proxying(&observer));

    let caller = GrainId::random(GrainKind::Grain);
    let msg = Message::new(Category::Application, Direction::Request)
        .with_sender(None, caller)
        .with_target(Some(center.my_address()), observer);
    center.send_message(msg);

    let rejection = receive(&center, Category::Application).await;
    assert_eq!(rejection.target_grain, Some(caller));
    assert!(rejection.rejection.unwrap().info.contains("No route to client"));

    center.stop().await;
}

#[tokio::test]
async fn test_unproxied_observer_stops_receiving() {
    let center = MessageCenterBuilder::new(gateway_config("unproxy"))
        .build()
        .await
        .unwrap();
    center.start().unwrap();
    let gateway = center.gateway().unwrap();

    let id = Uuid::new_v4();
    let observer = GrainId::random(GrainKind::ClientAddressableObject);
    let mut client = connect(&center, id).await;
    assert!(eventually(|| gateway.client(&GrainId::client(id)).is_some()).await);
    gateway.record_proxied_grain(observer, &GrainId::client(id));

    let notification = Message::new(Category::Application, Direction::OneWay)
        .with_target(Some(center.my_address()), observer);
    center.send_message(notification.clone());
    assert_eq!(client_recv(&mut client).await.id, notification.id);

    gateway.record_unproxied_grain(&observer);
    let msg = Message::new(Category::Application, Direction::Request)
        .with_sender(None, GrainId::random(GrainKind::Grain))
        .with_target(Some(center.my_address()), observer);
    center.send_message(msg);

    let rejection = receive(&center, Category::Application).await;
    assert!(rejection.rejection.unwrap().info.contains("No route to client"));

    center.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_batched_gateway_drains_pending_in_one_frame() {
    let mut config = gateway_config("batched-drain");
    config.messaging.use_message_batching = true;
    config.messaging.max_message_batching_size = 8;
    let center = MessageCenterBuilder::new(config).build().await.unwrap();
    center.start().unwrap();
    let gateway = center.gateway().unwrap();

    let id = Uuid::new_v4();
    let client_grain = GrainId::client(id);
    let observer = GrainId::random(GrainKind::ClientAddressableObject);
    let client = connect(&center, id).await;
    assert!(eventually(|| gateway.client(&client_grain).is_some()).await);
    gateway.record_proxied_grain(observer, &client_grain);
    client.close().await;
    assert!(eventually(|| gateway.client(&client_grain).map_or(false, |c| !c.is_connected())).await);

    let mut sent = Vec::new();
    for i in 0..3u8 {
        let msg = Message::new(Category::Application, Direction::OneWay)
            .with_target(Some(center.my_address()), observer)
            .with_body(vec![Bytes::from(vec![i])]);
        sent.push(msg.id);
        center.send_message(msg);
    }
    assert!(eventually(|| gateway.client(&client_grain).map_or(0, |c| c.pending_count()) == 3).await);

    let mut client = connect(&center, id).await;
    for expected in sent {
        assert_eq!(client_recv(&mut client).await.id, expected);
    }
    assert!(eventually(|| center.stats_snapshot().batches_sent == 1).await);
    assert_eq!(center.stats_snapshot().batched_messages_sent, 3);

    center.stop().await;
}

#[tokio::test]
async fn test_unserializable_response_reaches_client_as_error() {
    let directory = Arc::new(StaticDirectory::new());
    let center = MessageCenterBuilder::new(gateway_config("gw-codec"))
        .directory(directory.clone())
        .codec(Arc::new(FailingCodec))
        .build()
        .await
        .unwrap();
    center.start().unwrap();

    let grain = GrainId::random(GrainKind::Grain);
    directory.register(grain, center.my_address());

    let mut client = connect(&center, Uuid::new_v4()).await;
    let request = Message::new(Category::Application, Direction::Request)
        .with_sender(None, client.client_id())
        .with_target(None, grain);
    client.send(&request).await.unwrap();

    let received = receive(&center, Category::Application).await;
    let response = received
        .create_response()
        .with_body(vec![Bytes::from_static(UNSERIALIZABLE)]);
    center.send_message(response);

    let reply = client_recv(&mut client).await;
    assert_eq!(reply.id, request.id);
    assert_eq!(reply.result, ResponseType::Error);
    assert_eq!(center.stats_snapshot().serialization_failures, 1);

    center.stop().await;
}

#[tokio::test]
async fn test_silo_handshake_is_refused_by_gateway() {
    let center = MessageCenterBuilder::new(gateway_config("handshake"))
        .build()
        .await
        .unwrap();
    center.start().unwrap();

    let mut client = connect(&center, silo_network::DIRECT_CONNECTION_ID).await;
    let reply = tokio::time::timeout(RECEIVE_TIMEOUT, client.recv()).await.unwrap();
    assert!(matches!(reply, Ok(None) | Err(_)));
    assert_eq!(center.gateway().unwrap().client_count(), 0);

    center.stop().await;
}
