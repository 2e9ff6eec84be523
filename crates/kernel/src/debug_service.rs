//! DebugService: asynchronous, queue-backed log intake with
//! per-component level filtering and command tracing.
//!
//! Grounded on the original `debug_service.py`'s `asyncio.Queue` log intake
//! and `DebugServiceConfig` (global level + per-component overrides);
//! log records are handed to a bounded `tokio::sync::mpsc` channel at the
//! `debug/log` handler and drained by one background consumer task, so a
//! burst of log events never blocks the emitting service's handler.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::errors::KernelError;
use crate::events::{payloads::*, from_payload, to_payload, topic};
use crate::service::{Service, ServiceHandle};

const LOG_QUEUE_CAPACITY: usize = 256;
const MAX_TRACE_HISTORY: usize = 200;

fn level_rank(level: LogLevel) -> u8 {
    match level {
        LogLevel::Debug => 0,
        LogLevel::Info => 1,
        LogLevel::Warning => 2,
        LogLevel::Error => 3,
    }
}

fn parse_level(s: &str) -> Option<LogLevel> {
    match s.to_uppercase().as_str() {
        "DEBUG" => Some(LogLevel::Debug),
        "INFO" => Some(LogLevel::Info),
        "WARNING" | "WARN" => Some(LogLevel::Warning),
        "ERROR" => Some(LogLevel::Error),
        _ => None,
    }
}

pub struct DebugService {
    global_level: Mutex<LogLevel>,
    component_levels: DashMap<String, LogLevel>,
    trace_enabled: AtomicBool,
    performance_enabled: AtomicBool,
    performance_metrics: Mutex<std::collections::BTreeMap<String, serde_json::Value>>,
    command_traces: Mutex<VecDeque<String>>,
    log_tx: Mutex<Option<mpsc::Sender<DebugLogPayload>>>,
}

impl DebugService {
    pub fn new(default_level: LogLevel) -> Arc<Self> {
        Arc::new(Self {
            global_level: Mutex::new(default_level),
            component_levels: DashMap::new(),
            trace_enabled: AtomicBool::new(false),
            performance_enabled: AtomicBool::new(false),
            performance_metrics: Mutex::new(std::collections::BTreeMap::new()),
            command_traces: Mutex::new(VecDeque::new()),
            log_tx: Mutex::new(None),
        })
    }

    async fn effective_level(&self, component: &str) -> LogLevel {
        if let Some(level) = self.component_levels.get(component) {
            return *level;
        }
        *self.global_level.lock().await
    }

    async fn should_log(&self, component: &str, level: LogLevel) -> bool {
        level_rank(level) >= level_rank(self.effective_level(component).await)
    }

    async fn process_log(&self, entry: DebugLogPayload) {
        if !self.should_log(&entry.component, entry.level).await {
            return;
        }
        match entry.level {
            LogLevel::Debug => tracing::debug!(component = %entry.component, message = %entry.message, "debug/log"),
            LogLevel::Info => tracing::info!(component = %entry.component, message = %entry.message, "debug/log"),
            LogLevel::Warning => tracing::warn!(component = %entry.component, message = %entry.message, "debug/log"),
            LogLevel::Error => tracing::error!(component = %entry.component, message = %entry.message, "debug/log"),
        }
    }

    async fn handle_debug_command(self: &Arc<Self>, bus: &Arc<crate::bus::EventBus>, cmd: StandardizedCommandPayload) {
        let subcommand = cmd.subcommand.as_deref().unwrap_or_default();
        let message = match subcommand {
            "level" => self.handle_level_command(&cmd.args).await,
            "trace" => self.handle_trace_command(&cmd.args).await,
            "performance" => self.handle_performance_command(&cmd.args).await,
            other => format!("unknown debug subcommand '{other}'"),
        };
        let is_error = message.starts_with("error:");
        let response = CliResponsePayload { message, is_error };
        bus.emit(topic::CLI_RESPONSE, to_payload(&response)).await;
    }

    async fn handle_level_command(&self, args: &[String]) -> String {
        let (Some(target), Some(level_str)) = (args.first(), args.get(1)) else {
            return "error: usage: debug level <component|all> <LEVEL>".to_string();
        };
        let Some(level) = parse_level(level_str) else {
            return format!("error: unknown log level '{level_str}'");
        };
        if target == "all" {
            *self.global_level.lock().await = level;
            format!("global log level set to {level_str}")
        } else {
            self.component_levels.insert(target.clone(), level);
            format!("log level for '{target}' set to {level_str}")
        }
    }

    async fn handle_trace_command(&self, args: &[String]) -> String {
        match args.first().map(String::as_str) {
            Some("enable") => {
                self.trace_enabled.store(true, Ordering::SeqCst);
                "command tracing enabled".to_string()
            }
            Some("disable") => {
                self.trace_enabled.store(false, Ordering::SeqCst);
                "command tracing disabled".to_string()
            }
            _ => "error: usage: debug trace <enable|disable>".to_string(),
        }
    }

    async fn handle_performance_command(&self, args: &[String]) -> String {
        match args.first().map(String::as_str) {
            Some("enable") => {
                self.performance_enabled.store(true, Ordering::SeqCst);
                "performance tracking enabled".to_string()
            }
            Some("disable") => {
                self.performance_enabled.store(false, Ordering::SeqCst);
                "performance tracking disabled".to_string()
            }
            Some("show") => {
                let metrics = self.performance_metrics.lock().await;
                if metrics.is_empty() {
                    "no performance metrics recorded".to_string()
                } else {
                    metrics
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                }
            }
            _ => "error: usage: debug performance <enable|disable|show>".to_string(),
        }
    }

    async fn record_trace(&self, entry: String) {
        if !self.trace_enabled.load(Ordering::SeqCst) {
            return;
        }
        let mut traces = self.command_traces.lock().await;
        traces.push_back(entry);
        while traces.len() > MAX_TRACE_HISTORY {
            traces.pop_front();
        }
    }

    pub async fn recent_traces(&self) -> Vec<String> {
        self.command_traces.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl Service for DebugService {
    fn name(&self) -> &str {
        "debug"
    }

    async fn on_start(self: &Arc<Self>, handle: &ServiceHandle) -> Result<(), KernelError> {
        let (tx, mut rx) = mpsc::channel::<DebugLogPayload>(LOG_QUEUE_CAPACITY);
        *self.log_tx.lock().await = Some(tx);

        let this = self.clone();
        handle
            .spawn(async move {
                while let Some(entry) = rx.recv().await {
                    this.process_log(entry).await;
                }
            })
            .await;

        for pattern in ["debug level", "debug trace", "debug performance"] {
            let registration = RegisterCommandPayload {
                command: pattern.to_string(),
                handler_service: "debug".to_string(),
                event_topic: topic::DEBUG_COMMAND.to_string(),
            };
            handle.emit(topic::REGISTER_COMMAND, to_payload(&registration)).await;
        }

        let this = self.clone();
        handle
            .subscribe(
                topic::DEBUG_LOG,
                Arc::new(move |payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        let entry: DebugLogPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid debug/log payload".to_string())?;
                        let tx = this.log_tx.lock().await.clone();
                        if let Some(tx) = tx {
                            let _ = tx.send(entry).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        let bus = handle.bus().clone();
        handle
            .subscribe(
                topic::DEBUG_COMMAND,
                Arc::new(move |payload| {
                    let this = this.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        let cmd: StandardizedCommandPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid debug/command payload".to_string())?;
                        this.handle_debug_command(&bus, cmd).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        handle
            .subscribe(
                topic::DEBUG_COMMAND_TRACE,
                Arc::new(move |payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        this.record_trace(payload.to_string()).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        handle
            .subscribe(
                topic::DEBUG_PERFORMANCE,
                Arc::new(move |payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        if let Some(map) = payload.as_object() {
                            let mut metrics = this.performance_metrics.lock().await;
                            for (k, v) in map {
                                metrics.insert(k.clone(), v.clone());
                            }
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        handle
            .subscribe(
                topic::DEBUG_STATE_TRANSITION,
                Arc::new(move |payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        let entry = DebugLogPayload {
                            component: "state_transition".to_string(),
                            level: LogLevel::Debug,
                            message: payload.to_string(),
                            details: Default::default(),
                        };
                        this.process_log(entry).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        handle
            .subscribe(
                topic::DEBUG_CONFIG,
                Arc::new(move |payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        if let Some(component) = payload.get("component").and_then(|v| v.as_str()) {
                            if let Some(level) = payload.get("level").and_then(|v| v.as_str()).and_then(parse_level) {
                                this.component_levels.insert(component.to_string(), level);
                            }
                        } else if let Some(level) = payload.get("level").and_then(|v| v.as_str()).and_then(parse_level) {
                            *this.global_level.lock().await = level;
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        handle
            .subscribe(
                topic::DEBUG_SET_GLOBAL_LEVEL,
                Arc::new(move |payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        if let Some(level) = payload.get("level").and_then(|v| v.as_str()).and_then(parse_level) {
                            *this.global_level.lock().await = level;
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        Ok(())
    }
}
