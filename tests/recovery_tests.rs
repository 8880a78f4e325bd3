//! End-to-end recovery scenarios against the scripted transport stack.

mod support;

use std::sync::Arc;

use rabbithole::domain::{Arguments, ExchangeKind, ExchangeSpec, QueueSpec};
use rabbithole::port::ConsumeOptions;
use rabbithole::testkit::{ScriptedFactory, TestBroker};
use rabbithole::{Error, RecoveringConnection};

use support::{fast_config, force_disconnect, handler, init_tracing, wait_for, EventLog};

fn consume_options() -> ConsumeOptions {
    ConsumeOptions {
        auto_ack: true,
        ..ConsumeOptions::default()
    }
}

#[tokio::test]
async fn simple_reconnect_preserves_topology() {
    init_tracing();
    let broker = TestBroker::new();
    let factory = Arc::new(ScriptedFactory::new(broker.clone()));
    let connection = RecoveringConnection::connect(fast_config(&["a", "b"]), factory.clone())
        .await
        .unwrap();
    let log = EventLog::attach(&connection);

    let channel = connection.create_channel().await.unwrap();
    channel
        .exchange_declare("X", ExchangeSpec::new(ExchangeKind::Direct))
        .await
        .unwrap();
    channel.queue_declare("Q", QueueSpec::new()).await.unwrap();
    channel
        .queue_bind("Q", "X", "k", Arguments::new())
        .await
        .unwrap();
    let tag = channel
        .basic_consume("Q", "C", consume_options(), handler())
        .await
        .unwrap();
    assert_eq!(tag, "C");

    force_disconnect(&factory).await;
    wait_for("recovery to succeed", || log.recovery_succeeded() == 1).await;

    // Round-robin moved the replacement transport to the second endpoint.
    assert_eq!(factory.current_endpoint().unwrap().host(), "b");
    assert!(connection.is_open());

    let snapshot = connection.topology_snapshot();
    assert_eq!(snapshot.exchanges.len(), 1);
    assert_eq!(snapshot.exchanges[0].name, "X");
    assert_eq!(snapshot.queues.len(), 1);
    assert_eq!(snapshot.queues[0].name, "Q");
    assert_eq!(snapshot.bindings.len(), 1);
    assert_eq!(snapshot.bindings[0].source, "X");
    assert_eq!(snapshot.bindings[0].destination, "Q");
    assert_eq!(snapshot.bindings[0].routing_key, "k");
    assert_eq!(snapshot.consumers.len(), 1);
    assert_eq!(snapshot.consumers[0].tag, "C");

    assert_eq!(log.recovery_succeeded(), 1);
    assert_eq!(log.recovery_errors(), 0);
}

#[tokio::test]
async fn replay_follows_declaration_order() {
    let broker = TestBroker::new();
    let factory = Arc::new(ScriptedFactory::new(broker.clone()));
    let connection = RecoveringConnection::connect(fast_config(&["a"]), factory.clone())
        .await
        .unwrap();
    let log = EventLog::attach(&connection);

    let channel = connection.create_channel().await.unwrap();
    channel
        .exchange_declare("X", ExchangeSpec::new(ExchangeKind::Direct))
        .await
        .unwrap();
    channel.confirm_select().await.unwrap();
    channel.basic_qos(0, 25, false).await.unwrap();
    channel.queue_declare("Q", QueueSpec::new()).await.unwrap();
    channel
        .queue_bind("Q", "X", "k", Arguments::new())
        .await
        .unwrap();
    channel
        .basic_consume("Q", "C", consume_options(), handler())
        .await
        .unwrap();

    force_disconnect(&factory).await;
    wait_for("recovery to succeed", || log.recovery_succeeded() == 1).await;

    let operations = broker.operations();
    let last = |needle: &str| {
        operations
            .iter()
            .rposition(|op| op.starts_with(needle))
            .unwrap_or_else(|| panic!("no operation matching {needle}"))
    };

    // Channel-local state replays before topology, confirm mode before
    // prefetch; then exchanges, queues, bindings, consumers.
    assert!(last("confirm.select") < last("basic.qos"));
    assert!(last("basic.qos") < last("exchange.declare X"));
    assert!(last("exchange.declare X") < last("queue.declare Q"));
    assert!(last("queue.declare Q") < last("queue.bind X->Q"));
    assert!(last("queue.bind X->Q") < last("basic.consume Q"));
}

#[tokio::test]
async fn server_named_queue_rename_propagates() {
    let broker = TestBroker::new();
    broker.push_server_name("amq.gen-001");
    broker.push_consumer_tag("ct-1");

    let factory = Arc::new(ScriptedFactory::new(broker.clone()));
    let connection = RecoveringConnection::connect(fast_config(&["a"]), factory.clone())
        .await
        .unwrap();
    let log = EventLog::attach(&connection);

    let channel = connection.create_channel().await.unwrap();
    channel
        .exchange_declare("X", ExchangeSpec::new(ExchangeKind::Direct))
        .await
        .unwrap();
    let declared = channel
        .queue_declare("", QueueSpec::new().exclusive(true))
        .await
        .unwrap();
    assert_eq!(declared.name, "amq.gen-001");
    channel
        .queue_bind("amq.gen-001", "X", "k", Arguments::new())
        .await
        .unwrap();
    let tag = channel
        .basic_consume("amq.gen-001", "", consume_options(), handler())
        .await
        .unwrap();
    assert_eq!(tag, "ct-1");

    broker.push_server_name("amq.gen-002");
    broker.push_consumer_tag("ct-2");
    force_disconnect(&factory).await;
    wait_for("recovery to succeed", || log.recovery_succeeded() == 1).await;

    let snapshot = connection.topology_snapshot();
    assert_eq!(snapshot.queues.len(), 1);
    assert_eq!(snapshot.queues[0].name, "amq.gen-002");
    assert!(snapshot.queues[0].server_named);
    assert_eq!(snapshot.bindings.len(), 1);
    assert_eq!(snapshot.bindings[0].destination, "amq.gen-002");
    assert_eq!(snapshot.consumers.len(), 1);
    assert_eq!(snapshot.consumers[0].queue, "amq.gen-002");
    assert_eq!(snapshot.consumers[0].tag, "ct-2");

    assert_eq!(
        log.queue_renames(),
        vec![("amq.gen-001".to_string(), "amq.gen-002".to_string())]
    );
    assert_eq!(
        log.tag_changes(),
        vec![("ct-1".to_string(), "ct-2".to_string())]
    );
}

#[tokio::test]
async fn partial_topology_failure_is_isolated() {
    let broker = TestBroker::new();
    let factory = Arc::new(ScriptedFactory::new(broker.clone()));
    let connection = RecoveringConnection::connect(fast_config(&["a"]), factory.clone())
        .await
        .unwrap();
    let log = EventLog::attach(&connection);

    let channel = connection.create_channel().await.unwrap();
    channel
        .exchange_declare("X1", ExchangeSpec::new(ExchangeKind::Direct))
        .await
        .unwrap();
    channel
        .exchange_declare("X2", ExchangeSpec::new(ExchangeKind::Direct))
        .await
        .unwrap();
    channel.queue_declare("Q", QueueSpec::new()).await.unwrap();
    channel
        .queue_bind("Q", "X1", "k1", Arguments::new())
        .await
        .unwrap();
    channel
        .queue_bind("Q", "X2", "k2", Arguments::new())
        .await
        .unwrap();

    broker.break_exchange("X2");
    force_disconnect(&factory).await;
    wait_for("recovery to succeed", || log.recovery_succeeded() == 1).await;

    // One error for the X2 redeclare, one for the (X2, Q) binding.
    assert_eq!(log.recovery_errors(), 2);
    assert_eq!(log.recovery_succeeded(), 1);

    // The healthy items were replayed.
    assert_eq!(broker.exchange_declare_count("X1"), 2);
    assert_eq!(broker.queue_declare_count("Q"), 2);

    // The record is unchanged: failures do not erase topology.
    let snapshot = connection.topology_snapshot();
    assert_eq!(snapshot.exchanges.len(), 2);
    assert_eq!(snapshot.queues.len(), 1);
    assert_eq!(snapshot.bindings.len(), 2);

    let stats = connection.recovery_stats();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.topology_errors, 2);
}

#[tokio::test]
async fn reconnect_cycles_endpoints_until_one_accepts() {
    let broker = TestBroker::new();
    let factory = Arc::new(ScriptedFactory::new(broker.clone()));
    let connection = RecoveringConnection::connect(fast_config(&["a", "b"]), factory.clone())
        .await
        .unwrap();
    let log = EventLog::attach(&connection);
    connection.create_channel().await.unwrap();

    factory.push_connect_result(Err(Error::transport("connection refused")));
    factory.push_connect_result(Err(Error::transport("connection refused")));
    force_disconnect(&factory).await;
    wait_for("recovery to succeed", || log.recovery_succeeded() == 1).await;

    assert_eq!(log.recovery_errors(), 2);
    assert_eq!(factory.connect_count(), 4); // initial + three attempts

    let hosts: Vec<String> = factory
        .attempted_endpoints()
        .iter()
        .map(|e| e.host().to_string())
        .collect();
    assert_eq!(hosts, ["a", "b", "a", "b"]);

    let stats = connection.recovery_stats();
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.failed_attempts, 2);
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test]
async fn consecutive_disconnects_recover_each_time() {
    let broker = TestBroker::new();
    let factory = Arc::new(ScriptedFactory::new(broker.clone()));
    let connection = RecoveringConnection::connect(fast_config(&["a"]), factory.clone())
        .await
        .unwrap();
    let log = EventLog::attach(&connection);

    let channel = connection.create_channel().await.unwrap();
    channel.queue_declare("Q", QueueSpec::new()).await.unwrap();

    force_disconnect(&factory).await;
    wait_for("first recovery", || log.recovery_succeeded() == 1).await;

    force_disconnect(&factory).await;
    wait_for("second recovery", || log.recovery_succeeded() == 2).await;

    assert!(connection.is_open());
    assert_eq!(broker.queue_declare_count("Q"), 3);

    let snapshot = connection.topology_snapshot();
    assert_eq!(snapshot.queues.len(), 1);
    assert_eq!(snapshot.queues[0].name, "Q");
}
