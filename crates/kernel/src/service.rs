//! Service Lifecycle: uniform start/stop, subscription tracking, status
//! emission.
//!
//! Grounded on `examples/original_source/cantina_os/cantina_os/core/base_service.py`
//! for the shape of the lifecycle hooks, generalized to composition over
//! inheritance: there is no base class.
//! `ServiceHandle` is a plain struct every service is handed, and the
//! common start/stop sequencing lives in [`run_start`]/[`run_stop`] free
//! functions rather than in inherited state.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::bus::{EventBus, HandlerFn, HandlerId};
use crate::errors::KernelError;
use crate::events::{payloads::*, to_payload, topic};

/// The capability every service implements: start/stop hooks plus a name.
/// `status()` is tracked by [`ServiceHandle`], not by the implementor, so
/// the lifecycle runner is the single source of truth for it.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Register subscriptions and spawn any background tasks. Must not
    /// return before every subscription the service needs is registered —
    /// the runner emits `RUNNING` only after this future resolves.
    ///
    /// Takes `self: &Arc<Self>` (not `&self`) so handler closures can hold
    /// their own clone of the service without a separate weak-reference
    /// dance.
    async fn on_start(self: &Arc<Self>, handle: &ServiceHandle) -> Result<(), KernelError>;

    /// Release any resources that outlive owned tasks (which the runner
    /// already cancels). Most services need no override.
    async fn on_stop(self: &Arc<Self>, _handle: &ServiceHandle) -> Result<(), KernelError> {
        Ok(())
    }
}

/// Handed to every service; tracks subscriptions and owned tasks for
/// automatic cleanup on `stop()`, and provides `emit_status`/`subscribe`
/// convenience wrappers around the bus.
pub struct ServiceHandle {
    name: String,
    bus: Arc<EventBus>,
    subscriptions: Mutex<Vec<(String, HandlerId)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    status: Mutex<ServiceStatus>,
    stop_timeout: Duration,
}

impl ServiceHandle {
    pub fn new(name: impl Into<String>, bus: Arc<EventBus>, stop_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            bus,
            subscriptions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            status: Mutex::new(ServiceStatus::Initializing),
            stop_timeout,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn status(&self) -> ServiceStatus {
        *self.status.lock().await
    }

    /// Convenience wrapper over `EventBus::on` that records the
    /// registration for automatic cleanup in `stop()`.
    pub async fn subscribe(&self, topic: impl Into<String>, handler: HandlerFn) {
        let topic = topic.into();
        let id = self.bus.on(topic.clone(), self.name.clone(), handler);
        self.subscriptions.lock().await.push((topic, id));
    }

    /// Track a background task so `stop()` aborts it and awaits its exit.
    pub async fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(fut);
        self.tasks.lock().await.push(handle);
    }

    pub async fn emit(&self, topic: impl Into<String>, payload: serde_json::Value) {
        self.bus.emit(topic, payload).await;
    }

    /// Standard `service/status` event.
    pub async fn emit_status(&self, status: ServiceStatus, message: impl Into<String>, severity: Severity) {
        *self.status.lock().await = status;
        let payload = ServiceStatusPayload {
            service: self.name.clone(),
            status,
            message: message.into(),
            severity,
            timestamp: chrono::Utc::now(),
        };
        self.bus.emit(topic::SERVICE_STATUS, to_payload(&payload)).await;
    }

    async fn teardown(&self) {
        let subs = {
            let mut guard = self.subscriptions.lock().await;
            std::mem::take(&mut *guard)
        };
        for (topic, id) in subs {
            self.bus.off(&topic, id);
        }

        let tasks = {
            let mut guard = self.tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
            match tokio::time::timeout(self.stop_timeout, task).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        service = %self.name,
                        kind = "StopTimeout",
                        "owned task did not exit within stop timeout"
                    );
                }
            }
        }
    }
}

/// Generic start/stop runner, holding the one piece of base-class-shaped
/// state (`started`) the Rust borrow checker actually needs.
pub struct ServiceRunner<S: Service> {
    service: Arc<S>,
    handle: Arc<ServiceHandle>,
    started: AtomicBool,
}

impl<S: Service> ServiceRunner<S> {
    pub fn new(service: Arc<S>, bus: Arc<EventBus>, stop_timeout: Duration) -> Self {
        let handle = ServiceHandle::new(service.name().to_string(), bus, stop_timeout);
        Self {
            service,
            handle,
            started: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &Arc<ServiceHandle> {
        &self.handle
    }

    /// Emits `STARTING`, runs the service's `on_start` hook to completion
    /// (so every subscription it needs is registered), then emits
    /// `RUNNING`. Double-start is a no-op.
    pub async fn start(&self) -> Result<(), KernelError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.handle
            .emit_status(ServiceStatus::Starting, "starting", Severity::Info)
            .await;

        if let Err(e) = self.service.on_start(&self.handle).await {
            self.handle
                .emit_status(ServiceStatus::Error, e.to_string(), Severity::Error)
                .await;
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.handle
            .emit_status(ServiceStatus::Running, "running", Severity::Info)
            .await;
        Ok(())
    }

    /// Emits `STOPPING`, cancels owned tasks and removes subscriptions,
    /// runs the `on_stop` hook, then emits `STOPPED`. Double-stop is a
    /// no-op.
    pub async fn stop(&self) -> Result<(), KernelError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.handle
            .emit_status(ServiceStatus::Stopping, "stopping", Severity::Info)
            .await;

        self.handle.teardown().await;
        let result = self.service.on_stop(&self.handle).await;

        self.handle
            .emit_status(ServiceStatus::Stopped, "stopped", Severity::Info)
            .await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Echo {
        start_calls: AtomicUsize,
    }

    #[async_trait]
    impl Service for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn on_start(self: &Arc<Self>, handle: &ServiceHandle) -> Result<(), KernelError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            handle
                .subscribe(
                    "echo/ping",
                    std::sync::Arc::new(|_payload| Box::pin(async move { Ok(()) })),
                )
                .await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_emits_starting_then_running_and_registers_subscriptions_first() {
        let bus = EventBus::new(Duration::from_secs(5));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses2 = statuses.clone();
        bus.on(
            topic::SERVICE_STATUS,
            "observer",
            std::sync::Arc::new(move |payload| {
                let statuses2 = statuses2.clone();
                Box::pin(async move {
                    statuses2.lock().await.push(payload);
                    Ok(())
                })
            }),
        );

        let service = Arc::new(Echo {
            start_calls: AtomicUsize::new(0),
        });
        let runner = ServiceRunner::new(service.clone(), bus.clone(), Duration::from_secs(5));
        runner.start().await.unwrap();

        assert_eq!(bus.handler_count("echo/ping"), 1);
        let seen = statuses.lock().await;
        let kinds: Vec<ServiceStatus> = seen
            .iter()
            .map(|p| serde_json::from_value::<ServiceStatusPayload>(p.clone()).unwrap().status)
            .collect();
        assert_eq!(kinds, vec![ServiceStatus::Starting, ServiceStatus::Running]);
    }

    #[tokio::test]
    async fn double_start_is_a_noop() {
        let bus = EventBus::new(Duration::from_secs(5));
        let service = Arc::new(Echo {
            start_calls: AtomicUsize::new(0),
        });
        let runner = ServiceRunner::new(service.clone(), bus.clone(), Duration::from_secs(5));
        runner.start().await.unwrap();
        runner.start().await.unwrap();
        assert_eq!(service.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_removes_subscriptions() {
        let bus = EventBus::new(Duration::from_secs(5));
        let service = Arc::new(Echo {
            start_calls: AtomicUsize::new(0),
        });
        let runner = ServiceRunner::new(service.clone(), bus.clone(), Duration::from_secs(5));
        runner.start().await.unwrap();
        runner.stop().await.unwrap();
        assert_eq!(bus.handler_count("echo/ping"), 0);
    }
}
