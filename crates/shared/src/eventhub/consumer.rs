//! 事件消费者
//!
//! 以一个消费组身份读取 channel 的全部分区：每个分区一个独立任务，
//! 分区内严格顺序调用 handler，不同分区之间可以并发。所有分区任务共享同一个关闭信号，
//! 由 `JoinSet` 统一收集结果，任一分区遇到不可恢复错误都会让整个消费者进入 `Faulted`。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};

use super::credential::CredentialSource;
use super::kafka::KafkaEventSource;
use super::{EventSource, PartitionReceiver, StartPosition};
use crate::config::EventHubConfig;
use crate::error::EventBusError;
use crate::events::ReceivedEvent;
use crate::observability::{metrics, tracing as otel};

// ---------------------------------------------------------------------------
// ConsumerState
// ---------------------------------------------------------------------------

/// 消费者生命周期状态
///
/// `Uninitialized → Connecting → Running → {Stopping → Stopped | Faulted}`，
/// `Stopped` 与 `Faulted` 为终态，`Faulted` 需要由外部监管者重启进程。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Uninitialized,
    Connecting,
    Running,
    Stopping,
    Stopped,
    Faulted,
}

impl ConsumerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted)
    }

    fn can_transition_to(self, next: Self) -> bool {
        use ConsumerState::*;
        matches!(
            (self, next),
            (Uninitialized, Connecting | Stopped)
                | (Connecting, Running | Stopping | Stopped | Faulted)
                | (Running, Stopping | Stopped | Faulted)
                | (Stopping, Stopped | Faulted)
        )
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// EventHandler
// ---------------------------------------------------------------------------

/// 事件处理器
///
/// 单条事件的错误（反序列化、持久化）由实现自行记录，不返回给读取循环；
/// 同一分区内的调用严格串行。
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: ReceivedEvent);
}

// ---------------------------------------------------------------------------
// EventConsumer
// ---------------------------------------------------------------------------

struct LoopContext {
    channel: String,
    consumer_group: String,
}

/// 绑定到一个 channel 和一个消费组的事件消费者
pub struct EventConsumer {
    source: Arc<dyn EventSource>,
    context: Arc<LoopContext>,
    start_position: StartPosition,
    shutdown_timeout: Duration,
    state: watch::Sender<ConsumerState>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl EventConsumer {
    /// 校验配置后连接 EventHub
    ///
    /// 命名空间缺失时在任何网络调用之前返回 `Configuration` 错误。
    pub async fn connect(config: &EventHubConfig) -> Result<Self, EventBusError> {
        config.validate()?;
        let credential = CredentialSource::from_config(config)?;
        let source = KafkaEventSource::connect(config, &credential).await?;

        info!(
            namespace = %config.fully_qualified_namespace(),
            eventhub = %config.name,
            consumer_group = %config.consumer_group,
            start_position = %config.start_position,
            "EventHub 消费者已初始化"
        );
        Ok(Self::with_source(
            Arc::new(source),
            &config.name,
            &config.consumer_group,
            config.start_position,
            Duration::from_millis(config.shutdown_timeout_ms),
        ))
    }

    /// 使用自定义传输创建消费者
    pub fn with_source(
        source: Arc<dyn EventSource>,
        channel: impl Into<String>,
        consumer_group: impl Into<String>,
        start_position: StartPosition,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            source,
            context: Arc::new(LoopContext {
                channel: channel.into(),
                consumer_group: consumer_group.into(),
            }),
            start_position,
            shutdown_timeout,
            state: watch::channel(ConsumerState::Uninitialized).0,
            shutdown: watch::channel(false).0,
            started: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn consumer_group(&self) -> &str {
        &self.context.consumer_group
    }

    fn transition(&self, next: ConsumerState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(previous) = previous {
            info!(
                consumer_group = %self.context.consumer_group,
                from = %previous,
                to = %next,
                "消费者状态变更"
            );
        }
        changed
    }

    /// 读取全部分区直到被停止或遇到不可恢复错误
    ///
    /// 只能调用一次。正常停止时返回 `Ok(())`，状态为 `Stopped`；
    /// 出错时返回错误，状态为 `Faulted`。
    pub async fn run(&self, handler: Arc<dyn EventHandler>) -> Result<(), EventBusError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EventBusError::InvalidState(format!(
                "消费者已启动或已停止，当前状态: {}",
                self.state()
            )));
        }

        self.transition(ConsumerState::Connecting);
        let result = self.run_partitions(handler).await;
        self.source.close().await;

        match &result {
            Ok(()) => {
                self.transition(ConsumerState::Stopped);
            }
            Err(e) => {
                error!(
                    consumer_group = %self.context.consumer_group,
                    error = %e,
                    "消费者因不可恢复错误退出"
                );
                self.transition(ConsumerState::Faulted);
            }
        }
        result
    }

    async fn run_partitions(&self, handler: Arc<dyn EventHandler>) -> Result<(), EventBusError> {
        let partitions = self.source.partition_ids().await?;
        if partitions.is_empty() {
            return Err(EventBusError::FatalTransport(format!(
                "channel '{}' 没有分区",
                self.context.channel
            )));
        }

        let receivers = self
            .source
            .open_partitions(&partitions, self.start_position)
            .await?;

        let mut tasks = JoinSet::new();
        for receiver in receivers {
            tasks.spawn(partition_loop(
                receiver,
                Arc::clone(&handler),
                self.shutdown.subscribe(),
                Arc::clone(&self.context),
            ));
        }

        self.transition(ConsumerState::Running);
        info!(
            eventhub = %self.context.channel,
            consumer_group = %self.context.consumer_group,
            start_position = %self.start_position,
            partitions = ?partitions,
            "开始读取全部分区"
        );

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(EventBusError::FatalTransport(if e.is_panic() {
                    "分区读取任务 panic".to_string()
                } else {
                    format!("分区读取任务被取消: {e}")
                }))
            });

            if let Err(e) = outcome {
                if first_error.is_none() {
                    // 取消其余分区循环
                    self.shutdown.send_replace(true);
                    first_error = Some(e);
                } else {
                    warn!(error = %e, "其他分区同样出错");
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// 通知所有分区循环在当前 handler 调用完成后退出
    fn request_stop(&self) {
        self.shutdown.send_replace(true);
        self.transition(ConsumerState::Stopping);
    }

    /// 停止消费并等待所有分区循环退出
    ///
    /// 可与 `run` 并发调用；超过 `shutdown_timeout` 仍未退出时返回 `ShutdownTimeout`。
    /// 从未运行过的消费者直接进入 `Stopped`。
    pub async fn stop(&self) -> Result<(), EventBusError> {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.shutdown.send_replace(true);
            self.source.close().await;
            self.transition(ConsumerState::Stopped);
            return Ok(());
        }

        self.request_stop();
        let mut state = self.state.subscribe();
        let waited = tokio::time::timeout(self.shutdown_timeout, async move {
            state.wait_for(|s| s.is_terminal()).await.map(|_| ())
        })
        .await;

        match waited {
            Ok(_) => {
                info!(consumer_group = %self.context.consumer_group, "消费者已停止");
                Ok(())
            }
            Err(_) => {
                warn!(
                    consumer_group = %self.context.consumer_group,
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "等待分区循环退出超时"
                );
                Err(EventBusError::ShutdownTimeout(self.shutdown_timeout))
            }
        }
    }

    /// 运行直到 `signal` 完成，然后停止并等待分区循环退出
    pub async fn run_until<F>(
        &self,
        handler: Arc<dyn EventHandler>,
        signal: F,
    ) -> Result<(), EventBusError>
    where
        F: Future<Output = ()> + Send,
    {
        let run = self.run(handler);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = signal => {
                info!(
                    consumer_group = %self.context.consumer_group,
                    "收到停止信号，开始停止消费者"
                );
                self.request_stop();
                match tokio::time::timeout(self.shutdown_timeout, &mut run).await {
                    Ok(result) => result,
                    Err(_) => Err(EventBusError::ShutdownTimeout(self.shutdown_timeout)),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 分区读取循环
// ---------------------------------------------------------------------------

async fn partition_loop(
    mut receiver: Box<dyn PartitionReceiver>,
    handler: Arc<dyn EventHandler>,
    mut shutdown: watch::Receiver<bool>,
    context: Arc<LoopContext>,
) -> Result<(), EventBusError> {
    let partition = receiver.partition_id();
    info!(
        consumer_group = %context.consumer_group,
        partition,
        "分区读取循环已启动"
    );

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let received = tokio::select! {
            // 偏向关闭信号，保证收到关闭时能尽快退出
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }

            received = receiver.recv() => received,
        };

        // handler 在 select 之外调用，关闭信号不会打断进行中的处理
        match received {
            Ok(event) => {
                let offset = event.offset;
                dispatch(handler.as_ref(), event, &context).await;
                if let Err(e) = receiver.ack(offset) {
                    warn!(
                        consumer_group = %context.consumer_group,
                        partition,
                        offset,
                        error = %e,
                        "确认事件失败"
                    );
                }
            }
            Err(e) if e.is_fatal() => {
                error!(
                    consumer_group = %context.consumer_group,
                    partition,
                    error = %e,
                    "分区读取遇到不可恢复错误"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    consumer_group = %context.consumer_group,
                    partition,
                    error = %e,
                    "接收事件出错，继续读取"
                );
            }
        }
    }

    info!(
        consumer_group = %context.consumer_group,
        partition,
        "分区读取循环已退出"
    );
    Ok(())
}

async fn dispatch(handler: &dyn EventHandler, event: ReceivedEvent, context: &LoopContext) {
    metrics::record_event_received(&context.consumer_group, event.partition);

    let span = info_span!(
        "eventhub.process",
        eventhub = %context.channel,
        consumer_group = %context.consumer_group,
        partition = event.partition,
        offset = event.offset,
    );
    otel::set_parent_from_properties(&span, &event.properties);

    let started = Instant::now();
    handler.handle(event).instrument(span).await;
    metrics::record_handler_duration(&context.consumer_group, started.elapsed().as_secs_f64());
}
