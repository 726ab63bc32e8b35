//! One tenant's consumer: read a batch, then for each message
//! decode → tenant filter → claim → dispatch → record → acknowledge.
//!
//! Acknowledgement happens only after the terminal outcome is durably recorded.
//! Transient failures leave the message pending so the bus redelivers it; the rest
//! of that stream's batch is deferred with it to keep per-stream order.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use creditflow_core::{EventId, TenantId};
use creditflow_events::{EnvelopeError, StreamMessage, TenantEvent, TenantScoped};

use super::metrics::{ConsumerMetrics, ConsumerMetricsSnapshot, InFlight};
use super::state::{ConnectionState, StateCell};
use super::{ConsumerConfig, ConsumerDeps, ConsumerError, HandlerError, HandlerOutcome};
use crate::event_bus::{DeadLetter, ReadRequest};
use crate::idempotency::{ClaimOutcome, EventProcessingRecord, IdempotencyError, ProcessingKey, ProcessingResult};

/// Event type under which undecodable entries are recorded (keyed by bus entry id).
pub const MALFORMED_EVENT_TYPE: &str = "malformed";

/// Terminal (or deferred) result of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOutcome {
    Completed,
    Skipped,
    /// Already completed earlier; acknowledged without running the handler.
    Duplicate,
    /// Addressed to another tenant; acknowledged and ignored.
    Foreign,
    /// Left pending for redelivery.
    Retrying,
    /// Recorded `failed`, copied to the dead-letter stream and acknowledged.
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub read: usize,
    pub completed: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub foreign: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    /// Left pending behind an earlier retrying message of the same stream.
    pub deferred: usize,
    pub errors: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Completed => self.completed += 1,
            MessageOutcome::Skipped => self.skipped += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::Foreign => self.foreign += 1,
            MessageOutcome::Retrying => self.retrying += 1,
            MessageOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }

    fn merge(&mut self, other: &BatchReport) {
        self.read += other.read;
        self.completed += other.completed;
        self.skipped += other.skipped;
        self.duplicates += other.duplicates;
        self.foreign += other.foreign;
        self.retrying += other.retrying;
        self.dead_lettered += other.dead_lettered;
        self.deferred += other.deferred;
        self.errors += other.errors;
    }

    fn settled(&self) -> usize {
        self.completed + self.skipped + self.duplicates + self.foreign + self.dead_lettered
    }

    /// Nothing settled and something failed: the tenant's downstream is unhealthy.
    pub fn is_degraded(&self) -> bool {
        self.settled() == 0 && (self.retrying + self.errors) > 0
    }
}

pub struct TenantEventConsumer {
    tenant_id: TenantId,
    config: ConsumerConfig,
    group: String,
    consumer_name: String,
    deps: ConsumerDeps,
    state: StateCell,
    metrics: ConsumerMetrics,
    last_activity: Mutex<Instant>,
    shutdown: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TenantEventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantEventConsumer")
            .field("tenant_id", &self.tenant_id)
            .field("group", &self.group)
            .field("consumer", &self.consumer_name)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl TenantEventConsumer {
    pub fn new(tenant_id: TenantId, config: ConsumerConfig, deps: ConsumerDeps) -> Arc<Self> {
        let group = config.group_for(&tenant_id);
        let consumer_name = format!("{}-{}", tenant_id, uuid::Uuid::now_v7().simple());
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            tenant_id,
            config,
            group,
            consumer_name,
            deps,
            state: StateCell::new(),
            metrics: ConsumerMetrics::default(),
            last_activity: Mutex::new(Instant::now()),
            shutdown,
            task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// How long the consumer has been in its current state.
    pub fn state_age(&self) -> Duration {
        self.state.held_for()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> ConsumerMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.metrics.snapshot().in_flight
    }

    /// Time since the consumer last handled a message or was handed out.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn touch(&self) {
        if let Ok(mut t) = self.last_activity.lock() {
            *t = Instant::now();
        }
    }

    fn transition(&self, next: ConnectionState) -> Result<(), ConsumerError> {
        self.state
            .transition(next)
            .map(|_| ())
            .map_err(|from| ConsumerError::InvalidTransition {
                tenant_id: self.tenant_id.clone(),
                from,
                to: next,
            })
    }

    /// Connect to the bus and join this tenant's group on every stream.
    pub async fn initialize(&self) -> Result<(), ConsumerError> {
        if matches!(self.state(), ConnectionState::Active | ConnectionState::Reconnecting) {
            return Ok(());
        }
        self.transition(ConnectionState::Connecting)?;

        match self.join_groups().await {
            Ok(()) => {
                self.transition(ConnectionState::Active)?;
                info!(
                    tenant_id = %self.tenant_id,
                    group = %self.group,
                    streams = ?self.config.streams,
                    "tenant consumer connected"
                );
                Ok(())
            }
            Err(e) => {
                let _ = self.state.transition(ConnectionState::Disconnected);
                warn!(tenant_id = %self.tenant_id, error = %e, "tenant consumer failed to connect");
                Err(e)
            }
        }
    }

    async fn join_groups(&self) -> Result<(), ConsumerError> {
        ConsumerMetrics::incr(&self.metrics.bus_calls);
        self.deps.bus.ping().await?;
        for stream in &self.config.streams {
            ConsumerMetrics::incr(&self.metrics.bus_calls);
            self.deps.bus.ensure_group(stream, &self.group).await?;
        }
        Ok(())
    }

    /// Initialize if needed and spawn the polling loop. Idempotent while running.
    pub async fn start(self: &Arc<Self>) -> Result<(), ConsumerError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        self.initialize().await?;
        self.shutdown.send_replace(false);

        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run().await }));
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Only the read is cancelled by shutdown; a batch in progress finishes.
            let read = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                read = self.read_batch() => read,
            };

            match read {
                Ok(messages) if messages.is_empty() => {}
                Ok(messages) => {
                    let report = self.process_batch(messages).await;
                    if report.is_degraded() {
                        failures += 1;
                    } else {
                        failures = 0;
                    }
                }
                Err(e) => {
                    ConsumerMetrics::incr(&self.metrics.errors);
                    warn!(tenant_id = %self.tenant_id, error = %e, "stream read failed");
                    failures = (failures + 1).max(self.config.failure_threshold);
                }
            }

            if failures >= self.config.failure_threshold && !self.reconnect(failures, &mut shutdown).await {
                break;
            }
        }

        debug!(tenant_id = %self.tenant_id, "tenant consumer loop exited");
    }

    /// Back off, then rejoin the groups. Returns `false` if shutdown was requested.
    async fn reconnect(&self, failures: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        if self.state.transition(ConnectionState::Reconnecting).is_ok() {
            ConsumerMetrics::incr(&self.metrics.reconnects);
        }

        let attempt = failures.saturating_sub(self.config.failure_threshold) + 1;
        let delay = self.config.reconnect.delay_for_attempt(attempt);
        warn!(tenant_id = %self.tenant_id, failures, delay_ms = delay.as_millis() as u64, "tenant consumer backing off");

        tokio::select! {
            biased;
            _ = shutdown.changed() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        match self.join_groups().await {
            Ok(()) => {
                if self.state.transition(ConnectionState::Active).is_ok() {
                    info!(tenant_id = %self.tenant_id, "tenant consumer reconnected");
                }
            }
            Err(e) => warn!(tenant_id = %self.tenant_id, error = %e, "reconnect attempt failed"),
        }
        true
    }

    async fn read_batch(&self) -> Result<Vec<StreamMessage>, ConsumerError> {
        let request = ReadRequest {
            group: self.group.clone(),
            consumer: self.consumer_name.clone(),
            streams: self.config.streams.clone(),
            count: self.config.batch_size,
            block: self.config.block,
            pending_idle: self.config.pending_idle,
        };

        ConsumerMetrics::incr(&self.metrics.bus_calls);
        let messages = self.deps.bus.read_group(&request).await?;
        self.metrics
            .messages_read
            .fetch_add(messages.len() as u64, std::sync::atomic::Ordering::Relaxed);
        Ok(messages)
    }

    /// Read and process one batch (the loop body, callable directly).
    pub async fn poll_once(self: &Arc<Self>) -> Result<BatchReport, ConsumerError> {
        let messages = self.read_batch().await?;
        Ok(self.process_batch(messages).await)
    }

    /// Streams run concurrently (bounded by `worker_count`), messages of one
    /// stream run in order.
    pub async fn process_batch(self: &Arc<Self>, messages: Vec<StreamMessage>) -> BatchReport {
        let mut by_stream: Vec<(String, Vec<StreamMessage>)> = Vec::new();
        for msg in messages {
            match by_stream.iter_mut().find(|(stream, _)| *stream == msg.stream) {
                Some((_, batch)) => batch.push(msg),
                None => by_stream.push((msg.stream.clone(), vec![msg])),
            }
        }

        let permits = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let mut workers = JoinSet::new();
        for (stream, batch) in by_stream {
            let this = Arc::clone(self);
            let permits = permits.clone();
            workers.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                this.process_stream(&stream, batch).await
            });
        }

        let mut total = BatchReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => total.merge(&report),
                Err(e) => {
                    ConsumerMetrics::incr(&self.metrics.errors);
                    error!(tenant_id = %self.tenant_id, error = %e, "stream worker aborted");
                    total.errors += 1;
                }
            }
        }
        total
    }

    async fn process_stream(&self, stream: &str, batch: Vec<StreamMessage>) -> BatchReport {
        let mut report = BatchReport {
            read: batch.len(),
            ..BatchReport::default()
        };

        let mut messages = batch.into_iter();
        for msg in messages.by_ref() {
            match self.process_message(msg).await {
                Ok(MessageOutcome::Retrying) => {
                    report.retrying += 1;
                    break;
                }
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    ConsumerMetrics::incr(&self.metrics.errors);
                    warn!(tenant_id = %self.tenant_id, stream, error = %e, "message left pending");
                    report.errors += 1;
                    break;
                }
            }
        }

        report.deferred = messages.count();
        report
    }

    /// Process one delivery. `Err` means the message was left unacknowledged
    /// because of an infrastructure failure.
    pub async fn process_message(&self, msg: StreamMessage) -> Result<MessageOutcome, ConsumerError> {
        let _in_flight = InFlight::enter(&self.metrics.in_flight);
        self.touch();

        if msg
            .fields
            .get("tenant_id")
            .is_some_and(|t| t.trim() != self.tenant_id.as_str())
        {
            return self.ignore_foreign(&msg).await;
        }

        let event = match msg.decode() {
            Ok(event) => event,
            Err(err) => return self.skip_malformed(&msg, err).await,
        };
        if !event.belongs_to(&self.tenant_id) {
            return self.ignore_foreign(&msg).await;
        }

        self.dispatch(&msg, &event).await
    }

    #[instrument(
        skip_all,
        fields(tenant_id = %self.tenant_id, event_id = %event.id, event_type = %event.event_type, stream = %msg.stream)
    )]
    async fn dispatch(&self, msg: &StreamMessage, event: &TenantEvent) -> Result<MessageOutcome, ConsumerError> {
        let key = ProcessingKey::for_event(event);

        let Some(handler) = self.deps.handlers.get(&key.event_type) else {
            warn!("no handler for event type, skipping");
            self.record(&key, event, ProcessingResult::skipped(format!("unhandled event type {}", event.event_type)))
                .await?;
            self.ack(msg).await?;
            ConsumerMetrics::incr(&self.metrics.skipped);
            return Ok(MessageOutcome::Skipped);
        };

        let attempt = match self
            .deps
            .idempotency
            .claim(&key, event.entity_id.as_ref(), Utc::now())
            .await?
        {
            ClaimOutcome::AlreadyCompleted(_) => {
                debug!("event already processed");
                self.ack(msg).await?;
                ConsumerMetrics::incr(&self.metrics.duplicates);
                return Ok(MessageOutcome::Duplicate);
            }
            ClaimOutcome::Claimed { attempt } => attempt,
        };

        // Counted from claims, not bus deliveries: a message deferred behind a
        // failing one is redelivered without ever reaching its handler.
        if attempt > self.config.max_retries {
            let reason = format!("retry limit exceeded after {} attempts", attempt - 1);
            return self.give_up(msg, &key, event, attempt, reason).await;
        }

        let outcome = tokio::time::timeout(self.config.processing_timeout, handler.handle(event)).await;
        match outcome {
            Ok(Ok(HandlerOutcome::Completed(result))) => {
                if let Err(e) = self.record(&key, event, ProcessingResult::completed(result)).await {
                    error!(error = %e, "completion not recorded, leaving message unacknowledged");
                    return Err(e.into());
                }
                self.ack(msg).await?;
                ConsumerMetrics::incr(&self.metrics.completed);
                info!(attempt, handler = handler.name(), "event processed");
                Ok(MessageOutcome::Completed)
            }
            Ok(Ok(HandlerOutcome::Skipped(reason))) => {
                debug!(reason = %reason, "event skipped by handler");
                self.record(&key, event, ProcessingResult::skipped(reason)).await?;
                self.ack(msg).await?;
                ConsumerMetrics::incr(&self.metrics.skipped);
                Ok(MessageOutcome::Skipped)
            }
            Ok(Err(HandlerError::Malformed(err))) => {
                warn!(error = %err, "event payload malformed, skipping");
                self.record(&key, event, ProcessingResult::skipped(err.to_string())).await?;
                self.ack(msg).await?;
                ConsumerMetrics::incr(&self.metrics.skipped);
                Ok(MessageOutcome::Skipped)
            }
            Ok(Err(HandlerError::Rejected(reason))) => self.give_up(msg, &key, event, attempt, reason).await,
            Ok(Err(HandlerError::Transient(reason))) => Ok(self.defer(&key, event, attempt, reason).await),
            Err(_) => {
                let reason = format!("handler timed out after {:?}", self.config.processing_timeout);
                Ok(self.defer(&key, event, attempt, reason).await)
            }
        }
    }

    async fn record(
        &self,
        key: &ProcessingKey,
        event: &TenantEvent,
        result: ProcessingResult,
    ) -> Result<EventProcessingRecord, IdempotencyError> {
        self.deps
            .idempotency
            .record_result(key, event.entity_id.as_ref(), result, Utc::now())
            .await
    }

    async fn ack(&self, msg: &StreamMessage) -> Result<(), ConsumerError> {
        ConsumerMetrics::incr(&self.metrics.bus_calls);
        self.deps.bus.ack(&msg.stream, &self.group, &[msg.id.clone()]).await?;
        Ok(())
    }

    async fn ignore_foreign(&self, msg: &StreamMessage) -> Result<MessageOutcome, ConsumerError> {
        debug!(tenant_id = %self.tenant_id, message_id = %msg.id, "message for another tenant, ignoring");
        self.ack(msg).await?;
        ConsumerMetrics::incr(&self.metrics.foreign);
        Ok(MessageOutcome::Foreign)
    }

    /// Undecodable entries are recorded `skipped` and acknowledged, never retried.
    async fn skip_malformed(&self, msg: &StreamMessage, err: EnvelopeError) -> Result<MessageOutcome, ConsumerError> {
        warn!(
            tenant_id = %self.tenant_id,
            stream = %msg.stream,
            message_id = %msg.id,
            error = %err,
            "malformed envelope, skipping"
        );

        let key = ProcessingKey::new(EventId::from(msg.id.as_str()), MALFORMED_EVENT_TYPE, self.tenant_id.clone());
        if let Err(e) = self
            .deps
            .idempotency
            .record_result(&key, None, ProcessingResult::skipped(err.to_string()), Utc::now())
            .await
        {
            warn!(tenant_id = %self.tenant_id, error = %e, "could not record malformed message");
        }

        self.ack(msg).await?;
        ConsumerMetrics::incr(&self.metrics.skipped);
        Ok(MessageOutcome::Skipped)
    }

    /// Leave the message pending; the bus redelivers it after `pending_idle`.
    async fn defer(&self, key: &ProcessingKey, event: &TenantEvent, attempt: u32, reason: String) -> MessageOutcome {
        warn!(attempt, reason = %reason, "event processing failed, will retry");
        if let Err(e) = self.record(key, event, ProcessingResult::failed(reason)).await {
            warn!(error = %e, "could not record failed attempt");
        }
        ConsumerMetrics::incr(&self.metrics.retried);
        MessageOutcome::Retrying
    }

    /// Record `failed` for good, dead-letter and acknowledge.
    async fn give_up(
        &self,
        msg: &StreamMessage,
        key: &ProcessingKey,
        event: &TenantEvent,
        attempts: u32,
        reason: String,
    ) -> Result<MessageOutcome, ConsumerError> {
        error!(attempts, reason = %reason, "event failed permanently, dead-lettering");
        self.record(key, event, ProcessingResult::failed(reason.clone())).await?;

        ConsumerMetrics::incr(&self.metrics.bus_calls);
        self.deps
            .bus
            .dead_letter(
                msg,
                &DeadLetter {
                    reason,
                    attempts,
                    tenant_id: Some(self.tenant_id.to_string()),
                },
            )
            .await?;
        self.ack(msg).await?;

        ConsumerMetrics::incr(&self.metrics.failed);
        ConsumerMetrics::incr(&self.metrics.dead_lettered);
        Ok(MessageOutcome::DeadLettered)
    }

    /// Stop reading, let the batch in progress finish, then disconnect.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let _ = self.state.transition(ConnectionState::Draining);

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(tenant_id = %self.tenant_id, error = %e, "tenant consumer task failed");
        }

        let _ = self.state.transition(ConnectionState::Disconnected);
        info!(tenant_id = %self.tenant_id, metrics = ?self.metrics.snapshot(), "tenant consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use creditflow_core::{EntityId, OperationCode};
    use creditflow_credits::{CreditConfig, IdempotencyKey};

    use crate::consumer::{EventHandler, HandlerRegistry};
    use crate::cost_config::{CreditConfigResolver, InMemoryCreditConfigStore};
    use crate::event_bus::{InMemoryStreamBus, StreamBus, dead_letter_stream};
    use crate::idempotency::{EventIdempotencyStore, InMemoryIdempotencyStore, ProcessingStatus};
    use crate::ledger::{ALLOCATE_OPERATION, AllocateRequest, CreditLedger, InMemoryLedgerStore};
    use crate::read_model::Directory;
    use crate::retry::RetryPolicy;

    const STREAM: &str = "crm:credit-events";

    struct Harness {
        bus: Arc<InMemoryStreamBus>,
        idempotency: Arc<InMemoryIdempotencyStore>,
        ledger: Arc<CreditLedger>,
        consumer: Arc<TenantEventConsumer>,
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::default()
            .with_streams([STREAM])
            .with_block(Duration::from_millis(10))
            .with_pending_idle(Duration::ZERO)
            .with_reconnect(RetryPolicy::fixed(u32::MAX, Duration::from_millis(10)))
    }

    async fn harness_with(config: ConsumerConfig, registry: Option<HandlerRegistry>) -> Harness {
        let bus = Arc::new(InMemoryStreamBus::new());
        let idempotency = Arc::new(InMemoryIdempotencyStore::new());
        let ledger = Arc::new(CreditLedger::new(Arc::new(InMemoryLedgerStore::default())));
        let resolver = Arc::new(CreditConfigResolver::new(Arc::new(InMemoryCreditConfigStore::with_configs([
            CreditConfig::global("crm.leads.create", 5),
        ]))));
        let handlers = registry.unwrap_or_else(|| {
            HandlerRegistry::with_defaults(ledger.clone(), resolver, Arc::new(Directory::in_memory()))
        });

        let consumer = TenantEventConsumer::new(
            TenantId::from("T1"),
            config,
            ConsumerDeps {
                bus: bus.clone(),
                idempotency: idempotency.clone(),
                handlers: Arc::new(handlers),
            },
        );
        consumer.initialize().await.unwrap();

        Harness {
            bus,
            idempotency,
            ledger,
            consumer,
        }
    }

    async fn harness() -> Harness {
        harness_with(config(), None).await
    }

    fn payload(id: &str, tenant: &str, event_type: &str, entity: &str, data: serde_json::Value) -> String {
        json!({"id": id, "eventType": event_type, "tenantId": tenant, "entityId": entity, "data": data}).to_string()
    }

    async fn publish(bus: &InMemoryStreamBus, raw: String) {
        bus.append(STREAM, vec![("payload".to_string(), raw)]).await.unwrap();
    }

    async fn balance(h: &Harness) -> (i64, i64) {
        let b = h
            .ledger
            .balance(&TenantId::from("T1"), &EntityId::from("ORG-1"))
            .await
            .unwrap()
            .unwrap();
        (b.allocated_credits, b.used_credits)
    }

    #[tokio::test]
    async fn redelivered_event_is_applied_once() {
        let h = harness().await;
        let allocation = payload("e1", "T1", "credit.allocated", "ORG-1", json!({"amount": 100}));
        publish(&h.bus, allocation.clone()).await;
        publish(&h.bus, allocation).await;

        let report = h.consumer.poll_once().await.unwrap();
        assert_eq!((report.completed, report.duplicates), (1, 1));
        assert_eq!(balance(&h).await, (100, 0));
        assert_eq!(h.bus.pending_count(STREAM, h.consumer.group()), 0);
    }

    #[tokio::test]
    async fn crash_before_completion_record_does_not_double_allocate() {
        let h = harness().await;
        // First delivery reached the ledger, then the process died before recording.
        h.ledger
            .allocate(
                &TenantId::from("T1"),
                AllocateRequest {
                    entity_id: EntityId::from("ORG-1"),
                    amount: 100,
                    expires_at: None,
                    external_ref: None,
                    key: IdempotencyKey::for_event(&EventId::from("e1"), &OperationCode::from(ALLOCATE_OPERATION)),
                },
            )
            .await
            .unwrap();

        publish(&h.bus, payload("e1", "T1", "credit.allocated", "ORG-1", json!({"amount": 100}))).await;
        let report = h.consumer.poll_once().await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(balance(&h).await, (100, 0));
        let key = ProcessingKey::new(EventId::from("e1"), "credit.allocated", TenantId::from("T1"));
        assert!(h.idempotency.has_processed(&key).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_entry_does_not_block_the_stream() {
        let h = harness().await;
        publish(&h.bus, r#"{"id":"e0","eventType":"credit.allocated","tenantId":"T1","data":"{not json"}"#.to_string()).await;
        publish(&h.bus, payload("e1", "T1", "credit.allocated", "ORG-1", json!({"amount": 10}))).await;

        let report = h.consumer.poll_once().await.unwrap();
        assert_eq!((report.skipped, report.completed), (1, 1));
        assert_eq!(balance(&h).await, (10, 0));

        let malformed = ProcessingKey::new(EventId::from("1-0"), MALFORMED_EVENT_TYPE, TenantId::from("T1"));
        let record = h.idempotency.get(&malformed).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Skipped);
    }

    #[tokio::test]
    async fn unknown_types_are_skipped_and_foreign_tenants_ignored() {
        let h = harness().await;
        publish(&h.bus, payload("e1", "T1", "invoice.paid", "ORG-1", json!({}))).await;
        publish(&h.bus, payload("e2", "T2", "credit.allocated", "ORG-1", json!({"amount": 5}))).await;

        let report = h.consumer.poll_once().await.unwrap();
        assert_eq!((report.skipped, report.foreign), (1, 1));
        assert_eq!(h.idempotency.records_for(&TenantId::from("T2")).len(), 0);
        let unknown = ProcessingKey::new(EventId::from("e1"), "invoice.paid", TenantId::from("T1"));
        assert_eq!(h.idempotency.get(&unknown).await.unwrap().unwrap().status, ProcessingStatus::Skipped);
    }

    #[tokio::test]
    async fn domain_rejection_is_dead_lettered_not_retried() {
        let h = harness().await;
        publish(
            &h.bus,
            payload("e1", "T1", "credit.consumed", "ORG-1", json!({"operationCode": "crm.leads.create"})),
        )
        .await;

        let report = h.consumer.poll_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(h.bus.pending_count(STREAM, h.consumer.group()), 0);

        let dlq = h.bus.entries(&dead_letter_stream(STREAM));
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].fields.get("tenant_id").map(String::as_str), Some("T1"));
    }

    struct Flaky {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _event: &TenantEvent) -> Result<HandlerOutcome, HandlerError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(HandlerError::Transient("ledger unavailable".to_string()));
            }
            Ok(HandlerOutcome::Completed(json!({"ok": true})))
        }
    }

    fn flaky_registry(failures: u32) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "*",
            Arc::new(Flaky {
                failures_left: AtomicU32::new(failures),
            }),
        );
        registry
    }

    #[tokio::test]
    async fn transient_failures_retry_in_order_then_succeed() {
        let h = harness_with(config(), Some(flaky_registry(1))).await;
        publish(&h.bus, payload("e1", "T1", "credit.allocated", "ORG-1", json!({}))).await;
        publish(&h.bus, payload("e2", "T1", "credit.allocated", "ORG-1", json!({}))).await;

        let first = h.consumer.poll_once().await.unwrap();
        assert_eq!((first.retrying, first.deferred), (1, 1));
        assert!(first.is_degraded());
        assert_eq!(h.bus.pending_count(STREAM, h.consumer.group()), 2);

        let second = h.consumer.poll_once().await.unwrap();
        assert_eq!(second.completed, 2);
        let key = ProcessingKey::new(EventId::from("e1"), "credit.allocated", TenantId::from("T1"));
        assert_eq!(h.idempotency.get(&key).await.unwrap().unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let h = harness_with(config().with_max_retries(2), Some(flaky_registry(u32::MAX))).await;
        publish(&h.bus, payload("e1", "T1", "credit.allocated", "ORG-1", json!({}))).await;

        assert_eq!(h.consumer.poll_once().await.unwrap().retrying, 1);
        assert_eq!(h.consumer.poll_once().await.unwrap().retrying, 1);
        assert_eq!(h.consumer.poll_once().await.unwrap().dead_lettered, 1);

        assert_eq!(h.bus.pending_count(STREAM, h.consumer.group()), 0);
        assert_eq!(h.bus.entries(&dead_letter_stream(STREAM)).len(), 1);
        assert_eq!(h.consumer.metrics().dead_lettered, 1);
    }

    /// Fails every attempt of one event id, succeeds for the rest.
    struct FailsFor(&'static str);

    #[async_trait]
    impl EventHandler for FailsFor {
        fn name(&self) -> &str {
            "fails-for"
        }

        async fn handle(&self, event: &TenantEvent) -> Result<HandlerOutcome, HandlerError> {
            if event.id.as_str() == self.0 {
                return Err(HandlerError::Transient("ledger unavailable".to_string()));
            }
            Ok(HandlerOutcome::Completed(json!({"ok": true})))
        }
    }

    #[tokio::test]
    async fn messages_deferred_behind_a_failure_keep_their_retry_budget() {
        let mut registry = HandlerRegistry::new();
        registry.register("*", Arc::new(FailsFor("e1")));
        let h = harness_with(config().with_max_retries(2), Some(registry)).await;
        publish(&h.bus, payload("e1", "T1", "credit.allocated", "ORG-1", json!({}))).await;
        publish(&h.bus, payload("e2", "T1", "credit.allocated", "ORG-1", json!({}))).await;

        for _ in 0..2 {
            let report = h.consumer.poll_once().await.unwrap();
            assert_eq!((report.retrying, report.deferred), (1, 1));
        }
        let third = h.consumer.poll_once().await.unwrap();
        assert_eq!((third.dead_lettered, third.completed), (1, 1));

        let e2 = ProcessingKey::new(EventId::from("e2"), "credit.allocated", TenantId::from("T1"));
        let record = h.idempotency.get(&e2).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Completed);
        assert_eq!(record.retry_count, 1);
        assert_eq!(h.bus.entries(&dead_letter_stream(STREAM)).len(), 1);
        assert_eq!(h.bus.pending_count(STREAM, h.consumer.group()), 0);
    }

    /// Loses the first `completed` write, as a store outage right after the handler would.
    struct LosesFirstCompletion {
        inner: InMemoryIdempotencyStore,
        armed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl EventIdempotencyStore for LosesFirstCompletion {
        async fn has_processed(&self, key: &ProcessingKey) -> Result<bool, IdempotencyError> {
            self.inner.has_processed(key).await
        }

        async fn claim(
            &self,
            key: &ProcessingKey,
            entity_id: Option<&EntityId>,
            now: chrono::DateTime<Utc>,
        ) -> Result<ClaimOutcome, IdempotencyError> {
            self.inner.claim(key, entity_id, now).await
        }

        async fn record_result(
            &self,
            key: &ProcessingKey,
            entity_id: Option<&EntityId>,
            result: ProcessingResult,
            now: chrono::DateTime<Utc>,
        ) -> Result<EventProcessingRecord, IdempotencyError> {
            if result.status == ProcessingStatus::Completed && self.armed.swap(false, Ordering::SeqCst) {
                return Err(IdempotencyError::Unavailable("connection reset".to_string()));
            }
            self.inner.record_result(key, entity_id, result, now).await
        }

        async fn get(&self, key: &ProcessingKey) -> Result<Option<EventProcessingRecord>, IdempotencyError> {
            self.inner.get(key).await
        }

        async fn purge_expired(&self, now: chrono::DateTime<Utc>) -> Result<u64, IdempotencyError> {
            self.inner.purge_expired(now).await
        }
    }

    #[tokio::test]
    async fn lost_completion_record_leaves_message_pending_and_charges_once() {
        let bus = Arc::new(InMemoryStreamBus::new());
        let store = Arc::new(LosesFirstCompletion {
            inner: InMemoryIdempotencyStore::new(),
            armed: std::sync::atomic::AtomicBool::new(true),
        });
        let ledger = Arc::new(CreditLedger::new(Arc::new(InMemoryLedgerStore::default())));
        let resolver = Arc::new(CreditConfigResolver::new(Arc::new(InMemoryCreditConfigStore::with_configs([
            CreditConfig::global("crm.leads.create", 5),
        ]))));
        let consumer = TenantEventConsumer::new(
            TenantId::from("T1"),
            config(),
            ConsumerDeps {
                bus: bus.clone(),
                idempotency: store.clone(),
                handlers: Arc::new(HandlerRegistry::with_defaults(
                    ledger.clone(),
                    resolver,
                    Arc::new(Directory::in_memory()),
                )),
            },
        );
        consumer.initialize().await.unwrap();

        let tenant = TenantId::from("T1");
        ledger
            .allocate(
                &tenant,
                AllocateRequest {
                    entity_id: EntityId::from("ORG-1"),
                    amount: 100,
                    expires_at: None,
                    external_ref: None,
                    key: IdempotencyKey::for_event(&EventId::from("a1"), &OperationCode::from(ALLOCATE_OPERATION)),
                },
            )
            .await
            .unwrap();
        publish(
            &bus,
            payload("x1", "T1", "credit.consumed", "ORG-1", json!({"operationCode": "crm.leads.create"})),
        )
        .await;

        async fn used(ledger: &CreditLedger) -> i64 {
            ledger
                .balance(&TenantId::from("T1"), &EntityId::from("ORG-1"))
                .await
                .unwrap()
                .unwrap()
                .used_credits
        }

        let first = consumer.poll_once().await.unwrap();
        assert_eq!((first.completed, first.errors), (0, 1));
        assert_eq!(bus.pending_count(STREAM, consumer.group()), 1);
        assert_eq!(used(&ledger).await, 5);

        let second = consumer.poll_once().await.unwrap();
        assert_eq!(second.completed, 1);
        assert_eq!(bus.pending_count(STREAM, consumer.group()), 0);
        assert_eq!(used(&ledger).await, 5);

        let key = ProcessingKey::new(EventId::from("x1"), "credit.consumed", tenant.clone());
        assert!(store.has_processed(&key).await.unwrap());
    }

    struct Slow;

    #[async_trait]
    impl EventHandler for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn handle(&self, _event: &TenantEvent) -> Result<HandlerOutcome, HandlerError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(HandlerOutcome::Completed(json!({})))
        }
    }

    #[tokio::test]
    async fn slow_handlers_time_out_into_a_retry() {
        let mut registry = HandlerRegistry::new();
        registry.register("*", Arc::new(Slow));
        let h = harness_with(config().with_processing_timeout(Duration::from_millis(20)), Some(registry)).await;
        publish(&h.bus, payload("e1", "T1", "credit.allocated", "ORG-1", json!({}))).await;

        let report = h.consumer.poll_once().await.unwrap();
        assert_eq!(report.retrying, 1);
        let key = ProcessingKey::new(EventId::from("e1"), "credit.allocated", TenantId::from("T1"));
        let record = h.idempotency.get(&key).await.unwrap().unwrap();
        assert!(record.error_message.unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn streams_of_one_batch_are_processed_independently() {
        let streams = ["crm:credit-events", "crm:org-events"];
        let h = harness_with(config().with_streams(streams), None).await;
        h.bus
            .append(
                "crm:org-events",
                vec![(
                    "payload".to_string(),
                    payload("o1", "T1", "organization.created", "ORG-1", json!({"name": "Acme"})),
                )],
            )
            .await
            .unwrap();
        publish(&h.bus, payload("e1", "T1", "credit.allocated", "ORG-1", json!({"amount": 7}))).await;

        let report = h.consumer.poll_once().await.unwrap();
        assert_eq!(report.read, 2);
        assert_eq!(report.completed, 2);
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn loop_processes_then_drains_on_shutdown() {
        let h = harness().await;
        h.consumer.start().await.unwrap();
        h.consumer.start().await.unwrap();

        publish(&h.bus, payload("e1", "T1", "credit.allocated", "ORG-1", json!({"amount": 3}))).await;
        let consumer = h.consumer.clone();
        wait_for(move || consumer.metrics().completed == 1).await;

        h.consumer.shutdown().await;
        assert_eq!(h.consumer.state(), ConnectionState::Disconnected);
        assert_eq!(h.consumer.in_flight(), 0);
    }

    #[tokio::test]
    async fn bus_outage_moves_to_reconnecting_and_back() {
        let h = harness_with(config().with_failure_threshold(1), None).await;
        h.consumer.start().await.unwrap();

        h.bus.set_offline(true);
        let consumer = h.consumer.clone();
        wait_for(move || consumer.state() == ConnectionState::Reconnecting).await;

        h.bus.set_offline(false);
        let consumer = h.consumer.clone();
        wait_for(move || consumer.state() == ConnectionState::Active).await;
        assert!(h.consumer.metrics().reconnects >= 1);

        h.consumer.shutdown().await;
        assert_eq!(h.consumer.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn initialize_fails_fast_when_bus_is_down() {
        let bus = Arc::new(InMemoryStreamBus::new());
        bus.set_offline(true);
        let consumer = TenantEventConsumer::new(
            TenantId::from("T1"),
            config(),
            ConsumerDeps {
                bus,
                idempotency: Arc::new(InMemoryIdempotencyStore::new()),
                handlers: Arc::new(HandlerRegistry::new()),
            },
        );

        let err = consumer.initialize().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(consumer.state(), ConnectionState::Disconnected);
    }
}
