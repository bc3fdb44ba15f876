//! 事件投递集成测试
//!
//! 在内存通道上验证生产者到消费者的投递语义：最早位置读取、坏消息不中断循环、
//! 消费组相互独立、分区内有序、停止有界以及致命错误的处理。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use orderbus_shared::config::EventHubConfig;
use orderbus_shared::error::EventBusError;
use orderbus_shared::eventhub::{
    ConsumerState, EventConsumer, EventHandler, EventProducer, StartPosition,
};
use orderbus_shared::events::ReceivedEvent;
use orderbus_shared::test_utils::{InMemoryChannel, RecordingHandler, test_order};

const WAIT: Duration = Duration::from_secs(5);

fn producer(channel: &InMemoryChannel) -> EventProducer {
    EventProducer::with_sender(channel.sender(), channel.name(), 1_048_576)
}

fn consumer(channel: &InMemoryChannel, group: &str, position: StartPosition) -> Arc<EventConsumer> {
    Arc::new(EventConsumer::with_source(
        channel.source(group),
        channel.name(),
        group,
        position,
        Duration::from_secs(2),
    ))
}

fn spawn_run(
    consumer: &Arc<EventConsumer>,
    handler: Arc<dyn EventHandler>,
) -> tokio::task::JoinHandle<Result<(), EventBusError>> {
    let consumer = Arc::clone(consumer);
    tokio::spawn(async move { consumer.run(handler).await })
}

async fn wait_running(consumer: &EventConsumer) {
    let mut state = consumer.subscribe_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == ConsumerState::Running))
        .await
        .expect("消费者未进入 Running")
        .expect("状态通道已关闭");
}

#[tokio::test]
async fn test_published_payload_is_delivered() {
    let channel = InMemoryChannel::new("orders", 4);
    let consumer = consumer(&channel, "accounting", StartPosition::Earliest);
    let handler = Arc::new(RecordingHandler::new());
    let running = spawn_run(&consumer, handler.clone());
    wait_running(&consumer).await;

    let payload = test_order("order-42").to_bytes();
    producer(&channel).publish(&payload).await.unwrap();

    assert!(handler.wait_for_count(1, WAIT).await);
    let delivered = handler.events();
    assert!(delivered.iter().any(|e| e.body == payload));
    assert_eq!(delivered[0].decode_order().unwrap().order_id, "order-42");

    consumer.stop().await.unwrap();
    running.await.unwrap().unwrap();
}

/// 记录解码结果，解码失败不影响后续事件
#[derive(Default)]
struct DecodingHandler {
    decoded: parking_lot::Mutex<Vec<String>>,
    failures: AtomicUsize,
}

#[async_trait]
impl EventHandler for DecodingHandler {
    async fn handle(&self, event: ReceivedEvent) {
        match event.decode_order() {
            Ok(order) => self.decoded.lock().push(order.order_id),
            Err(_) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[tokio::test]
async fn test_malformed_payload_does_not_stop_loop() {
    let channel = InMemoryChannel::new("orders", 1);
    let producer = producer(&channel);
    producer.publish(&[0x0a, 0xff, 0xff, 0x01]).await.unwrap();
    producer
        .publish(&test_order("order-after-garbage").to_bytes())
        .await
        .unwrap();

    let consumer = consumer(&channel, "fraud-detection", StartPosition::Earliest);
    let handler = Arc::new(DecodingHandler::default());
    let running = spawn_run(&consumer, handler.clone());

    tokio::time::timeout(WAIT, async {
        while handler.decoded.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(handler.failures.load(Ordering::SeqCst), 1);
    assert_eq!(*handler.decoded.lock(), vec!["order-after-garbage".to_string()]);
    assert_eq!(consumer.state(), ConsumerState::Running);

    consumer.stop().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_consumer_groups_are_independent() {
    let channel = InMemoryChannel::new("orders", 3);
    let producer = producer(&channel);
    for i in 0..6 {
        producer
            .publish(format!("order-{i}").as_bytes())
            .await
            .unwrap();
    }

    let fraud = consumer(&channel, "fraud-detection", StartPosition::Earliest);
    let fraud_handler = Arc::new(RecordingHandler::new());
    let fraud_run = spawn_run(&fraud, fraud_handler.clone());
    assert!(fraud_handler.wait_for_count(6, WAIT).await);

    // fraud-detection 读完之后 accounting 仍能从头读到全部历史
    let accounting = consumer(&channel, "accounting", StartPosition::Earliest);
    let accounting_handler = Arc::new(RecordingHandler::new());
    let accounting_run = spawn_run(&accounting, accounting_handler.clone());
    assert!(accounting_handler.wait_for_count(6, WAIT).await);

    let mut fraud_bodies = fraud_handler.bodies();
    let mut accounting_bodies = accounting_handler.bodies();
    fraud_bodies.sort();
    accounting_bodies.sort();
    assert_eq!(fraud_bodies, accounting_bodies);
    assert_eq!(fraud_bodies.len(), 6);

    fraud.stop().await.unwrap();
    accounting.stop().await.unwrap();
    fraud_run.await.unwrap().unwrap();
    accounting_run.await.unwrap().unwrap();
}

/// 记录处理中的调用，停止后不应再有调用进行
struct SlowHandler {
    in_flight: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl EventHandler for SlowHandler {
    async fn handle(&self, _event: ReceivedEvent) {
        self.in_flight.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_stop_is_bounded_and_waits_for_in_flight_handler() {
    let channel = InMemoryChannel::new("orders", 2);
    for i in 0..20 {
        channel.publish_raw(None, format!("order-{i}").into_bytes());
    }

    let consumer = consumer(&channel, "accounting", StartPosition::Earliest);
    let handler = Arc::new(SlowHandler {
        in_flight: AtomicBool::new(false),
        calls: AtomicUsize::new(0),
    });
    let running = spawn_run(&consumer, handler.clone());
    wait_running(&consumer).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    let started = tokio::time::Instant::now();
    consumer.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!handler.in_flight.load(Ordering::SeqCst));
    assert_eq!(consumer.state(), ConsumerState::Stopped);

    let calls_after_stop = handler.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), calls_after_stop);
    assert!(calls_after_stop < 20);

    running.await.unwrap().unwrap();
    assert!(channel.is_source_closed("accounting"));
}

#[tokio::test]
async fn test_stop_times_out_when_handler_hangs() {
    let channel = InMemoryChannel::new("orders", 1);
    channel.publish_raw(Some(0), b"stuck".to_vec());

    let consumer = Arc::new(EventConsumer::with_source(
        channel.source("accounting"),
        channel.name(),
        "accounting",
        StartPosition::Earliest,
        Duration::from_millis(100),
    ));
    let handler = Arc::new(RecordingHandler::with_delay(Duration::from_secs(30)));
    let _running = spawn_run(&consumer, handler);
    wait_running(&consumer).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = consumer.stop().await.unwrap_err();
    assert!(matches!(err, EventBusError::ShutdownTimeout(_)));
    assert_eq!(consumer.state(), ConsumerState::Stopping);
}

#[tokio::test]
async fn test_missing_namespace_fails_without_network() {
    let config = EventHubConfig::default();

    let err = EventProducer::connect(&config).await.err().unwrap();
    assert!(matches!(err, EventBusError::Configuration(_)));

    let err = EventConsumer::connect(&config).await.err().unwrap();
    assert!(matches!(err, EventBusError::Configuration(_)));
}

#[tokio::test]
async fn test_single_partition_preserves_order() {
    let channel = InMemoryChannel::new("orders", 1);
    let producer = producer(&channel);
    for payload in ["order-1", "order-2", "order-3"] {
        producer.publish(payload.as_bytes()).await.unwrap();
    }

    let consumer = consumer(&channel, "fraud-detection", StartPosition::Earliest);
    let handler = Arc::new(RecordingHandler::new());
    let running = spawn_run(&consumer, handler.clone());
    assert!(handler.wait_for_count(3, WAIT).await);

    assert_eq!(
        handler.bodies(),
        vec![b"order-1".to_vec(), b"order-2".to_vec(), b"order-3".to_vec()]
    );

    consumer.stop().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_fatal_transport_error_faults_consumer() {
    let channel = InMemoryChannel::new("orders", 3);
    let consumer = consumer(&channel, "accounting", StartPosition::Earliest);
    let running = spawn_run(&consumer, Arc::new(RecordingHandler::new()));
    wait_running(&consumer).await;

    channel.inject_fatal(1, "凭据已被撤销");

    let err = tokio::time::timeout(WAIT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, EventBusError::FatalTransport(_)));
    assert_eq!(consumer.state(), ConsumerState::Faulted);

    // Faulted 之后 stop 立即返回
    consumer.stop().await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Faulted);
}

#[tokio::test]
async fn test_committed_position_resumes_after_restart() {
    let channel = InMemoryChannel::new("orders", 1);
    let producer = producer(&channel);
    producer.publish(b"order-1").await.unwrap();
    producer.publish(b"order-2").await.unwrap();

    let first = consumer(&channel, "accounting", StartPosition::Committed);
    let first_handler = Arc::new(RecordingHandler::new());
    let first_run = spawn_run(&first, first_handler.clone());
    assert!(first_handler.wait_for_count(2, WAIT).await);
    first.stop().await.unwrap();
    first_run.await.unwrap().unwrap();

    producer.publish(b"order-3").await.unwrap();

    let second = consumer(&channel, "accounting", StartPosition::Committed);
    let second_handler = Arc::new(RecordingHandler::new());
    let second_run = spawn_run(&second, second_handler.clone());
    assert!(second_handler.wait_for_count(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(second_handler.bodies(), vec![b"order-3".to_vec()]);

    // earliest 每次都重读全部历史
    let replay = consumer(&channel, "accounting", StartPosition::Earliest);
    let replay_handler = Arc::new(RecordingHandler::new());
    let replay_run = spawn_run(&replay, replay_handler.clone());
    assert!(replay_handler.wait_for_count(3, WAIT).await);

    second.stop().await.unwrap();
    replay.stop().await.unwrap();
    second_run.await.unwrap().unwrap();
    replay_run.await.unwrap().unwrap();
}

/// 处理到指定负载时 panic，模拟进程在 handler 执行中崩溃
struct CrashOn {
    body: &'static [u8],
    handled: parking_lot::Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl EventHandler for CrashOn {
    async fn handle(&self, event: ReceivedEvent) {
        if event.body == self.body {
            panic!("handler 在处理 {:?} 时崩溃", event.offset);
        }
        self.handled.lock().push(event.body);
    }
}

#[tokio::test]
async fn test_event_in_flight_during_crash_is_redelivered() {
    let channel = InMemoryChannel::new("orders", 1);
    let producer = producer(&channel);
    for body in [b"order-1", b"order-2", b"order-3"] {
        producer.publish(body).await.unwrap();
    }

    let crashing = consumer(&channel, "accounting", StartPosition::Committed);
    let handler = Arc::new(CrashOn {
        body: b"order-2",
        handled: parking_lot::Mutex::new(Vec::new()),
    });
    let err = tokio::time::timeout(WAIT, crashing.run(handler.clone()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, EventBusError::FatalTransport(_)));
    assert_eq!(*handler.handled.lock(), vec![b"order-1".to_vec()]);
    // 只有处理完成的 order-1 被确认
    assert_eq!(channel.committed("accounting", 0), Some(1));

    let restarted = consumer(&channel, "accounting", StartPosition::Committed);
    let recorder = Arc::new(RecordingHandler::new());
    let running = spawn_run(&restarted, recorder.clone());
    assert!(recorder.wait_for_count(2, WAIT).await);
    assert_eq!(
        recorder.bodies(),
        vec![b"order-2".to_vec(), b"order-3".to_vec()]
    );

    restarted.stop().await.unwrap();
    running.await.unwrap().unwrap();
    assert_eq!(channel.committed("accounting", 0), Some(3));
}

#[tokio::test]
async fn test_latest_skips_history() {
    let channel = InMemoryChannel::new("orders", 1);
    let producer = producer(&channel);
    producer.publish(b"old").await.unwrap();

    let consumer = consumer(&channel, "fraud-detection", StartPosition::Latest);
    let handler = Arc::new(RecordingHandler::new());
    let running = spawn_run(&consumer, handler.clone());
    wait_running(&consumer).await;

    producer.publish(b"new").await.unwrap();
    assert!(handler.wait_for_count(1, WAIT).await);
    assert_eq!(handler.bodies(), vec![b"new".to_vec()]);

    consumer.stop().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_publish_failure_is_reported_once() {
    let channel = InMemoryChannel::new("orders", 1);
    channel.fail_next_publish(EventBusError::Publish("throttled".to_string()));
    let producer = producer(&channel);

    let err = producer.publish(b"order-1").await.unwrap_err();
    assert!(err.is_retryable());
    assert!(channel.is_empty());

    producer.publish(b"order-1").await.unwrap();
    assert_eq!(channel.len(), 1);
}
