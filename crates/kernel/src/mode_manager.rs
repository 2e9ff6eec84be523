//! ModeManager: three-(in practice five-)state `SystemMode` machine
//! with transactional transitions.
//!
//! Grounded on
//! `examples/original_source/src/services/yoda_mode_manager_service.py` for
//! the state machine shape and on
//! `examples/original_source/tests/bus/test_transaction_context.py` for the
//! `TransactionContext` rollback/compensation mechanics `request_transition`
//! drives. The described per-transition emit sequence numbers started ->
//! apply -> complete -> `system/mode/change`, but that only makes sense if
//! `system/mode/change` is emitted *before* `mode/transition/complete`:
//! rollback triggers "if any peer handler of `system/mode/change` errors",
//! which requires observing those handlers' outcome before declaring the
//! transition complete. The reference end-to-end scenario for engaging
//! interactive mode confirms this reading (`started`, `system/mode/change`,
//! `complete`, then `RUNNING`). This module follows that order; see
//! `DESIGN.md`.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::bus::{EventBus, TransactionContext};
use crate::errors::KernelError;
use crate::events::{payloads::*, from_payload, to_payload, topic};
use crate::memory::MemoryService;
use crate::service::{Service, ServiceHandle};

/// Single-token commands mapped directly onto a target `SystemMode`.
/// The CLI surface lists `engage`/`disengage`/`ambient`/`idle` as
/// plain commands, so `CommandDispatcher` routes them to
/// `system/set_mode/request` as `StandardizedCommandPayload`s (no `mode`
/// field) rather than the typed `SystemSetModeRequestPayload` a programmatic
/// caller would send; `resolve_requested_mode` accepts either shape.
fn mode_for_command(command: &str) -> Option<SystemMode> {
    match command {
        "engage" => Some(SystemMode::Interactive),
        "disengage" => Some(SystemMode::Idle),
        "ambient" => Some(SystemMode::Ambient),
        "idle" => Some(SystemMode::Idle),
        _ => None,
    }
}

pub struct ModeManager {
    bus: Arc<EventBus>,
    memory: Arc<MemoryService>,
    current: Mutex<SystemMode>,
    transition_lock: Mutex<()>,
}

impl ModeManager {
    pub fn new(bus: Arc<EventBus>, memory: Arc<MemoryService>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            memory,
            current: Mutex::new(SystemMode::Startup),
            transition_lock: Mutex::new(()),
        })
    }

    pub async fn current_mode(&self) -> SystemMode {
        *self.current.lock().await
    }

    fn resolve_requested_mode(&self, payload: &Value) -> Result<SystemMode, KernelError> {
        if let Some(direct) = from_payload::<SystemSetModeRequestPayload>(payload) {
            return Ok(direct.mode);
        }
        if let Some(cmd) = from_payload::<StandardizedCommandPayload>(payload) {
            return mode_for_command(&cmd.command).ok_or_else(|| {
                KernelError::DispatchInvalidPayload(format!(
                    "no mode mapping for command '{}'",
                    cmd.command
                ))
            });
        }
        Err(KernelError::DispatchInvalidPayload(
            "system/set_mode/request payload has neither 'mode' nor 'command'".to_string(),
        ))
    }

    /// Drive one transactional transition: `started` → apply →
    /// `system/mode/change` → `complete`, or roll back to `failed` +
    /// `DEGRADED` if a `system/mode/change` peer handler errors or times
    /// out. Concurrent callers serialize on `transition_lock`; a
    /// same-to-same request is a no-op.
    pub async fn request_transition(self: &Arc<Self>, new_mode: SystemMode) -> Result<(), KernelError> {
        let _guard = self.transition_lock.lock().await;
        let old = *self.current.lock().await;

        if old == new_mode {
            tracing::debug!(mode = %old, "redundant mode transition request ignored");
            return Ok(());
        }

        let tx = TransactionContext::new(self.bus.clone());

        let started = ModeTransitionPayload {
            old,
            new: new_mode,
            status: TransitionStatus::Started,
            error: None,
            timestamp: Utc::now(),
        };
        tx.emit(topic::MODE_TRANSITION_STARTED, to_payload(&started))
            .await
            .map_err(|reason| KernelError::TransitionFailed {
                old: old.to_string(),
                new: new_mode.to_string(),
                reason,
            })?;

        *self.current.lock().await = new_mode;

        let change = SystemModeChangePayload {
            old,
            new: new_mode,
            timestamp: Utc::now(),
        };
        let this = self.clone();
        let outcome = tx
            .emit_with_compensation(
                topic::SYSTEM_MODE_CHANGE,
                to_payload(&change),
                Some(Arc::new(move || {
                    let this = this.clone();
                    Box::pin(async move {
                        *this.current.lock().await = old;
                    })
                })),
            )
            .await
            .map_err(|reason| KernelError::TransitionFailed {
                old: old.to_string(),
                new: new_mode.to_string(),
                reason,
            })?;

        if !outcome.errors.is_empty() || outcome.timed_out {
            let reason = if outcome.timed_out {
                "system/mode/change handlers timed out".to_string()
            } else {
                outcome
                    .errors
                    .iter()
                    .map(|(i, m)| format!("#{i}: {m}"))
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            tx.rollback().await.map_err(|e| KernelError::TransitionFailed {
                old: old.to_string(),
                new: new_mode.to_string(),
                reason: e,
            })?;

            let failed = ModeTransitionPayload {
                old,
                new: new_mode,
                status: TransitionStatus::Failed,
                error: Some(reason.clone()),
                timestamp: Utc::now(),
            };
            self.bus.emit(topic::MODE_TRANSITION_FAILED, to_payload(&failed)).await;

            let status = ServiceStatusPayload {
                service: "mode_manager".to_string(),
                status: ServiceStatus::Degraded,
                message: format!("mode transition {old} -> {new_mode} rolled back: {reason}"),
                severity: Severity::Error,
                timestamp: Utc::now(),
            };
            self.bus.emit(topic::SERVICE_STATUS, to_payload(&status)).await;

            return Err(KernelError::TransitionFailed {
                old: old.to_string(),
                new: new_mode.to_string(),
                reason,
            });
        }

        tx.commit().await.map_err(|reason| KernelError::TransitionFailed {
            old: old.to_string(),
            new: new_mode.to_string(),
            reason,
        })?;

        let complete = ModeTransitionPayload {
            old,
            new: new_mode,
            status: TransitionStatus::Completed,
            error: None,
            timestamp: Utc::now(),
        };
        self.bus.emit(topic::MODE_TRANSITION_COMPLETE, to_payload(&complete)).await;

        let _ = self.memory.set("mode", Value::String(new_mode.to_string())).await;

        let status = ServiceStatusPayload {
            service: "mode_manager".to_string(),
            status: ServiceStatus::Running,
            message: format!("successfully transitioned to {new_mode} mode"),
            severity: Severity::Info,
            timestamp: Utc::now(),
        };
        self.bus.emit(topic::SERVICE_STATUS, to_payload(&status)).await;

        Ok(())
    }
}

#[async_trait]
impl Service for ModeManager {
    fn name(&self) -> &str {
        "mode_manager"
    }

    async fn on_start(self: &Arc<Self>, handle: &ServiceHandle) -> Result<(), KernelError> {
        for command in ["engage", "disengage", "ambient", "idle"] {
            let registration = RegisterCommandPayload {
                command: command.to_string(),
                handler_service: "mode_manager".to_string(),
                event_topic: topic::SYSTEM_SET_MODE_REQUEST.to_string(),
            };
            handle.emit(topic::REGISTER_COMMAND, to_payload(&registration)).await;
        }

        let this = self.clone();
        handle
            .subscribe(
                topic::SYSTEM_SET_MODE_REQUEST,
                Arc::new(move |payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        let mode = this.resolve_requested_mode(&payload).map_err(|e| e.to_string())?;
                        this.request_transition(mode).await.map_err(|e| e.to_string())
                    })
                }),
            )
            .await;

        Ok(())
    }
}
