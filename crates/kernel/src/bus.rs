//! EventBus: topic-addressed async pub/sub with emit-awaits-all-handlers
//! semantics.
//!
//! Grounded on `examples/original_source/cantina_os/cantina_os/event_bus.py`:
//! handlers are dispatched concurrently per `emit`, the whole batch is raced
//! against a timeout (`asyncio.wait_for(asyncio.gather(*tasks), timeout=5.0)`
//! there; `FuturesUnordered` + `tokio::time::timeout` here), and a handler
//! that errors is logged and reported but never stops its siblings or
//! propagates out of `emit`.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::events::{payloads::*, to_payload, topic, Event};

/// A registered handler. Handlers must be cooperative (non-blocking); blocking
/// work belongs in a `tokio::task::spawn_blocking` inside the handler body.
pub type HandlerFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: u64,
    owning_service: String,
    handler: HandlerFn,
}

/// Handle returned by [`EventBus::on`], used to unregister via [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Outcome of a single `emit` call, useful for tests asserting ordering and
/// completion properties.
#[derive(Debug, Clone)]
pub struct EmitOutcome {
    pub topic: String,
    pub handlers_invoked: usize,
    pub errors: Vec<(usize, String)>,
    pub timed_out: bool,
}

pub struct EventBus {
    handlers: DashMap<String, Vec<Registration>>,
    next_id: AtomicU64,
    emit_counter: AtomicU64,
    handler_timeout: Duration,
}

impl EventBus {
    pub fn new(handler_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
            emit_counter: AtomicU64::new(0),
            handler_timeout,
        })
    }

    /// Register `handler` for `topic`, owned by `owning_service`.
    ///
    /// Synchronous with respect to the caller: the handler is live in the
    /// per-topic list before this call returns, so registration and removal
    /// are observable before the next emit on that topic.
    pub fn on(
        &self,
        topic: impl Into<String>,
        owning_service: impl Into<String>,
        handler: HandlerFn,
    ) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let reg = Registration {
            id,
            owning_service: owning_service.into(),
            handler,
        };
        self.handlers.entry(topic.into()).or_default().push(reg);
        HandlerId(id)
    }

    /// Remove a specific handler. Idempotent: removing an already-removed
    /// or unknown id is a no-op.
    pub fn off(&self, topic: &str, id: HandlerId) {
        if let Some(mut entry) = self.handlers.get_mut(topic) {
            entry.retain(|r| r.id != id.0);
        }
    }

    /// Remove all handlers for `topic`, or every handler on every topic if
    /// `topic` is `None`.
    pub fn remove_all_listeners(&self, topic: Option<&str>) {
        match topic {
            Some(t) => {
                self.handlers.remove(t);
            }
            None => self.handlers.clear(),
        }
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.handlers.get(topic).map(|e| e.len()).unwrap_or(0)
    }

    /// Deliver `payload` to every handler currently registered for `topic`,
    /// in registration order, and await completion of all of them (or the
    /// per-emit timeout).
    ///
    /// A handler error never stops its siblings and never propagates out of
    /// `emit`: it is logged and reported on `service/status` with kind
    /// `HandlerError`. On timeout, outstanding handlers are abandoned and a
    /// `service/status` event of kind `HandlerTimeout` is reported, also
    /// without propagating.
    pub async fn emit(self: &Arc<Self>, topic: impl Into<String>, payload: Value) -> EmitOutcome {
        let topic = topic.into();
        self.emit_counter.fetch_add(1, Ordering::SeqCst);

        let registrations: Vec<Registration> = self
            .handlers
            .get(&topic)
            .map(|e| e.clone())
            .unwrap_or_default();

        let mut futures = FuturesUnordered::new();
        for (index, reg) in registrations.iter().enumerate() {
            let handler = reg.handler.clone();
            let payload = payload.clone();
            futures.push(async move {
                let result = handler(payload).await;
                (index, result)
            });
        }

        let mut errors = Vec::new();
        let mut handlers_invoked = 0usize;
        let mut timed_out = false;

        let gather = async {
            while let Some((index, result)) = futures.next().await {
                handlers_invoked += 1;
                if let Err(message) = result {
                    errors.push((index, message));
                }
            }
        };

        if tokio::time::timeout(self.handler_timeout, gather)
            .await
            .is_err()
        {
            timed_out = true;
            tracing::error!(
                topic = %topic,
                timeout_secs = self.handler_timeout.as_secs_f64(),
                "emit timed out waiting for handlers; outstanding handlers abandoned"
            );
        }

        for (index, message) in &errors {
            tracing::error!(topic = %topic, handler_index = index, error = %message, "handler error");
        }

        if !errors.is_empty() || timed_out {
            self.report_handler_fault(&topic, &errors, timed_out).await;
        }

        EmitOutcome {
            topic,
            handlers_invoked,
            errors,
            timed_out,
        }
    }

    async fn report_handler_fault(self: &Arc<Self>, topic: &str, errors: &[(usize, String)], timed_out: bool) {
        if topic == topic::SERVICE_STATUS {
            // Avoid feedback loops reporting faults in the fault-reporting topic itself.
            return;
        }
        let (kind, message) = if timed_out {
            ("HandlerTimeout", format!("emit on '{topic}' timed out"))
        } else {
            let summary = errors
                .iter()
                .map(|(i, m)| format!("#{i}: {m}"))
                .collect::<Vec<_>>()
                .join("; ")
                + &format!(" (topic={topic})");
            ("HandlerError", summary)
        };
        let status = ServiceStatusPayload {
            service: "event_bus".to_string(),
            status: ServiceStatus::Running,
            message: format!("{kind}: {message}"),
            severity: Severity::Error,
            timestamp: chrono::Utc::now(),
        };
        self.emit(topic::SERVICE_STATUS, to_payload(&status)).await;
    }

    pub fn emit_count(&self) -> u64 {
        self.emit_counter.load(Ordering::SeqCst)
    }
}

/// Build a no-payload [`Event`] and emit it, convenience for topics whose
/// payload is genuinely empty.
pub async fn emit_empty(bus: &Arc<EventBus>, topic: impl Into<String>) -> EmitOutcome {
    let event = Event::empty(topic);
    bus.emit(event.topic, event.payload).await
}

/// A compensating action run, in reverse registration order, when a
/// [`TransactionContext`] rolls back.
pub type CompensatingAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Open / committed / rolled-back state of a [`TransactionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

/// Groups a sequence of `emit`s into an atomic-looking unit with
/// compensating rollback, used by [`crate::mode_manager`] to implement
/// transactional mode transitions.
///
/// Grounded on
/// `examples/original_source/tests/bus/test_transaction_context.py`'s
/// `TransactionContext`/`TransactionState`, adapted from Python's `async
/// with ctx as tx: ...` to explicit `commit()`/`rollback()` calls — Rust has
/// no async `Drop`, so the caller (not a context-manager exit hook) decides
/// which one to run.
pub struct TransactionContext {
    bus: Arc<EventBus>,
    state: tokio::sync::Mutex<TransactionState>,
    compensations: tokio::sync::Mutex<Vec<CompensatingAction>>,
    grace_period: Option<Duration>,
}

impl TransactionContext {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            state: tokio::sync::Mutex::new(TransactionState::Open),
            compensations: tokio::sync::Mutex::new(Vec::new()),
            grace_period: None,
        }
    }

    /// As `new`, but bounds how long each `emit` blocks the transaction body
    /// on slow handlers: `emit` races the bus delivery against
    /// `grace_period` and returns early if it elapses, letting handlers
    /// finish in the background rather than holding up the transaction.
    pub fn with_grace_period(bus: Arc<EventBus>, grace_period: Duration) -> Self {
        Self {
            grace_period: Some(grace_period),
            ..Self::new(bus)
        }
    }

    pub async fn state(&self) -> TransactionState {
        *self.state.lock().await
    }

    pub async fn emit(&self, topic: impl Into<String>, payload: Value) -> Result<EmitOutcome, String> {
        self.emit_with_compensation(topic, payload, None).await
    }

    /// Emit within the transaction, optionally registering a compensating
    /// action to run (in reverse order with its siblings) if the
    /// transaction is later rolled back.
    pub async fn emit_with_compensation(
        &self,
        topic: impl Into<String>,
        payload: Value,
        compensating_action: Option<CompensatingAction>,
    ) -> Result<EmitOutcome, String> {
        {
            let state = self.state.lock().await;
            if *state != TransactionState::Open {
                return Err(format!("cannot emit on a transaction in state {:?}", *state));
            }
        }

        let topic = topic.into();
        let outcome = match self.grace_period {
            Some(grace) => {
                let bus = self.bus.clone();
                let topic2 = topic.clone();
                let task = tokio::spawn(async move { bus.emit(topic2, payload).await });
                match tokio::time::timeout(grace, task).await {
                    Ok(Ok(outcome)) => outcome,
                    // Grace period elapsed (or the task panicked): the
                    // handlers keep running in the background, the
                    // transaction just doesn't wait on them any longer.
                    Ok(Err(_)) | Err(_) => EmitOutcome {
                        topic: topic.clone(),
                        handlers_invoked: 0,
                        errors: Vec::new(),
                        timed_out: false,
                    },
                }
            }
            None => self.bus.emit(topic, payload).await,
        };

        if let Some(action) = compensating_action {
            self.compensations.lock().await.push(action);
        }
        Ok(outcome)
    }

    pub async fn commit(&self) -> Result<(), String> {
        let mut state = self.state.lock().await;
        if *state != TransactionState::Open {
            return Err(format!("cannot commit a transaction in state {:?}", *state));
        }
        *state = TransactionState::Committed;
        Ok(())
    }

    /// Roll back: mark the transaction rolled back, then run every
    /// registered compensating action in reverse order.
    pub async fn rollback(&self) -> Result<(), String> {
        {
            let mut state = self.state.lock().await;
            if *state != TransactionState::Open {
                return Err(format!("cannot roll back a transaction in state {:?}", *state));
            }
            *state = TransactionState::RolledBack;
        }
        let actions = {
            let mut guard = self.compensations.lock().await;
            std::mem::take(&mut *guard)
        };
        for action in actions.into_iter().rev() {
            action().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn handler_ok(calls: Arc<Mutex<Vec<Value>>>) -> HandlerFn {
        Arc::new(move |payload| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.lock().unwrap().push(payload);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn emit_invokes_handlers_in_registration_order() {
        let bus = EventBus::new(Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            bus.on(
                "test/event",
                "svc",
                Arc::new(move |_payload| {
                    let order = order.clone();
                    Box::pin(async move {
                        order.lock().unwrap().push(i);
                        Ok(())
                    })
                }),
            );
        }

        bus.emit("test/event", Value::Null).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn emit_on_unknown_topic_is_a_noop() {
        let bus = EventBus::new(Duration::from_secs(5));
        let outcome = bus.emit("nobody/listens", Value::Null).await;
        assert_eq!(outcome.handlers_invoked, 0);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn handler_error_does_not_stop_siblings_or_propagate() {
        // Mirrors S6: two handlers for test/event, first raises, second appends.
        let bus = EventBus::new(Duration::from_secs(5));
        let appended = Arc::new(Mutex::new(Vec::new()));

        bus.on(
            "test/event",
            "first",
            Arc::new(|_payload| Box::pin(async move { Err("boom".to_string()) })),
        );
        bus.on("test/event", "second", handler_ok(appended.clone()));

        let status_calls = Arc::new(Mutex::new(Vec::new()));
        bus.on(
            topic::SERVICE_STATUS,
            "observer",
            handler_ok(status_calls.clone()),
        );

        let outcome = bus.emit("test/event", Value::Null).await;

        assert_eq!(appended.lock().unwrap().len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(!outcome.timed_out);

        let statuses = status_calls.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        let status: ServiceStatusPayload = serde_json::from_value(statuses[0].clone()).unwrap();
        assert!(status.message.contains("HandlerError"));
    }

    #[tokio::test]
    async fn off_is_idempotent_and_stops_delivery() {
        let bus = EventBus::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let id = bus.on(
            "topic",
            "svc",
            Arc::new(move |_| {
                let calls2 = calls2.clone();
                Box::pin(async move {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        bus.off("topic", id);
        bus.off("topic", id); // idempotent
        bus.emit("topic", Value::Null).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn emit_times_out_slow_handlers() {
        let bus = EventBus::new(Duration::from_millis(20));
        bus.on(
            "slow",
            "svc",
            Arc::new(|_| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            }),
        );
        let outcome = bus.emit("slow", Value::Null).await;
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn remove_all_listeners_clears_topic() {
        let bus = EventBus::new(Duration::from_secs(5));
        let calls = Arc::new(Mutex::new(Vec::new()));
        bus.on("topic", "svc", handler_ok(calls.clone()));
        bus.remove_all_listeners(Some("topic"));
        bus.emit("topic", Value::Null).await;
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transaction_commits_and_emits_in_order() {
        let bus = EventBus::new(Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.on("test/event1", "svc", handler_ok(order.clone()));
        bus.on("test/event2", "svc", handler_ok(order.clone()));

        let tx = TransactionContext::new(bus.clone());
        tx.emit("test/event1", serde_json::json!({"data": "first"})).await.unwrap();
        tx.emit("test/event2", serde_json::json!({"data": "second"})).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(tx.state().await, TransactionState::Committed);
        let seen = order.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["data"], "first");
        assert_eq!(seen[1]["data"], "second");
    }

    #[tokio::test]
    async fn transaction_rollback_runs_compensations_in_reverse_order() {
        let bus = EventBus::new(Duration::from_secs(5));
        let tx = TransactionContext::new(bus.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (topic, label) in [("test/event1", "first"), ("test/event2", "second"), ("test/event3", "third")] {
            let order = order.clone();
            tx.emit_with_compensation(
                topic,
                Value::Null,
                Some(Arc::new(move || {
                    let order = order.clone();
                    let label = label.to_string();
                    Box::pin(async move { order.lock().unwrap().push(label) })
                })),
            )
            .await
            .unwrap();
        }

        tx.rollback().await.unwrap();
        assert_eq!(tx.state().await, TransactionState::RolledBack);
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn transaction_rejects_operations_after_commit() {
        let bus = EventBus::new(Duration::from_secs(5));
        let tx = TransactionContext::new(bus);
        tx.commit().await.unwrap();

        assert!(tx.emit("test/event", Value::Null).await.is_err());
        assert!(tx.commit().await.is_err());
        assert!(tx.rollback().await.is_err());
    }

    #[tokio::test]
    async fn transaction_with_grace_period_commits_despite_slow_handler() {
        let bus = EventBus::new(Duration::from_secs(5));
        bus.on(
            "test/event",
            "svc",
            Arc::new(|_| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                })
            }),
        );

        let tx = TransactionContext::with_grace_period(bus, Duration::from_millis(20));
        tx.emit("test/event", Value::Null).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(tx.state().await, TransactionState::Committed);
    }
}
