//! CommandDispatcher: parses `cli/command` lines, matches the longest
//! registered compound command (falling back to a single-token match),
//! standardizes the payload, and routes it to the owning service's topic.
//!
//! Grounded on
//! `examples/original_source/cantina_os/cantina_os/services/command_dispatcher_service.py`,
//! with one deliberate departure recorded in `DESIGN.md`: the Python source
//! resolves ties by registration/iteration order, but compound matches must
//! take precedence without qualification, so this dispatcher always tries
//! the longest possible token prefix first, shrinking until a registered
//! pattern matches.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

use crate::errors::KernelError;
use crate::events::{payloads::*, from_payload, to_payload, topic};
use crate::memory::MemoryService;
use crate::service::{Service, ServiceHandle};

/// `(owning_service, event_topic)` a matched pattern routes to.
type Route = (String, String);

pub struct CommandDispatcher {
    memory: Arc<MemoryService>,
    patterns: DashMap<String, Route>,
    shortcuts: DashMap<String, String>,
}

impl CommandDispatcher {
    pub fn new(memory: Arc<MemoryService>) -> Arc<Self> {
        let this = Arc::new(Self {
            memory,
            patterns: DashMap::new(),
            shortcuts: DashMap::new(),
        });
        this.register_builtin_patterns();
        this.register_builtin_shortcuts();
        this
    }

    /// `eye` commands have no owning service in this kernel — LED hardware
    /// is out of scope — but the CLI surface still names them, so they are
    /// registered here directly rather than through `register/command`
    /// self-registration (there is no service to send it). `dj` commands
    /// are registered the same way for symmetry even though `DjModeService`
    /// does exist: its `on_start` only subscribes to `dj/command`, it has
    /// no other service's pattern to announce, so routing it through a
    /// built-in here avoids a self-registration call that would add no
    /// information the dispatcher doesn't already have.
    fn register_builtin_patterns(&self) {
        for (pattern, owning_service, owning_topic) in [
            ("eye pattern", "external", topic::EYE_COMMAND),
            ("eye test", "external", topic::EYE_COMMAND),
            ("eye status", "external", topic::EYE_COMMAND),
            ("dj start", "dj_mode", topic::DJ_COMMAND),
            ("dj stop", "dj_mode", topic::DJ_COMMAND),
            ("dj next", "dj_mode", topic::DJ_COMMAND),
            ("dj queue", "dj_mode", topic::DJ_COMMAND),
        ] {
            self.patterns
                .insert(pattern.to_string(), (owning_service.to_string(), owning_topic.to_string()));
        }
    }

    fn register_builtin_shortcuts(&self) {
        for (short, full) in [
            ("e", "engage"),
            ("d", "disengage"),
            ("a", "ambient"),
            ("i", "idle"),
            ("djs", "dj stop"),
            ("djn", "dj next"),
            ("q", "quit"),
            ("h", "help"),
            ("s", "status"),
        ] {
            self.shortcuts.insert(short.to_string(), full.to_string());
        }
    }

    /// `register(pattern, service_name, event_topic)`; re-registration
    /// overwrites.
    pub fn register(&self, pattern: &str, service_name: &str, event_topic: &str) {
        self.patterns.insert(
            pattern.trim().to_lowercase(),
            (service_name.to_string(), event_topic.to_string()),
        );
    }

    /// All registered patterns, including the built-ins, sorted for stable
    /// `help` output and a deterministic register round-trip.
    pub fn get_registered_commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self.patterns.iter().map(|e| e.key().clone()).collect();
        commands.extend(["help", "status", "reset", "quit"].map(str::to_string));
        commands.sort();
        commands.dedup();
        commands
    }

    /// Try the longest possible token prefix first, shrinking to a single
    /// token. Returns the matched route and how many leading tokens it
    /// consumed.
    fn resolve(&self, tokens: &[String]) -> Option<(Route, usize)> {
        for len in (1..=tokens.len()).rev() {
            let candidate = tokens[..len].join(" ");
            if let Some(entry) = self.patterns.get(&candidate) {
                return Some((entry.value().clone(), len));
            }
        }
        None
    }

    async fn respond(&self, bus: &crate::bus::EventBus, is_error: bool, message: impl Into<String>) {
        let payload = CliResponsePayload {
            message: message.into(),
            is_error,
        };
        bus.emit(topic::CLI_RESPONSE, to_payload(&payload)).await;
    }

    /// Parse, match, standardize, and route one `cli/command` payload.
    pub async fn handle(self: &Arc<Self>, bus: &Arc<crate::bus::EventBus>, payload: CliCommandPayload) {
        let normalized = payload.raw_input.trim().to_lowercase();
        let mut tokens: Vec<String> = normalized.split_whitespace().map(str::to_string).collect();

        if tokens.is_empty() {
            self.respond(bus, true, "empty command; type 'help' for a list").await;
            return;
        }

        if let Some(expanded) = self.shortcuts.get(&tokens[0]).map(|e| e.clone()) {
            let mut expanded_tokens: Vec<String> = expanded.split_whitespace().map(str::to_string).collect();
            expanded_tokens.extend(tokens.drain(1..));
            tokens = expanded_tokens;
        }

        if tokens.len() == 1 {
            match tokens[0].as_str() {
                "help" => {
                    self.handle_help(bus).await;
                    return;
                }
                "status" => {
                    self.handle_status(bus).await;
                    return;
                }
                "reset" => {
                    self.handle_reset(bus).await;
                    return;
                }
                "quit" => {
                    self.handle_quit(bus).await;
                    return;
                }
                _ => {}
            }
        }

        match self.resolve(&tokens) {
            Some(((_service, owning_topic), matched_len)) => {
                let matched = &tokens[..matched_len];
                let command = matched[0].clone();
                let subcommand = if matched.len() > 1 {
                    Some(matched[1..].join(" "))
                } else {
                    None
                };
                let args = tokens[matched_len..].to_vec();

                let standardized = StandardizedCommandPayload {
                    command,
                    subcommand,
                    args,
                    raw_input: payload.raw_input.clone(),
                    conversation_id: payload.conversation_id.clone(),
                    timestamp: Utc::now(),
                    source: "cli".to_string(),
                };
                bus.emit(owning_topic, to_payload(&standardized)).await;
            }
            None => {
                self.respond(
                    bus,
                    true,
                    format!(
                        "unknown command: '{}'; type 'help' for a list",
                        payload.raw_input.trim()
                    ),
                )
                .await;
            }
        }
    }

    async fn handle_help(&self, bus: &Arc<crate::bus::EventBus>) {
        let commands = self.get_registered_commands();
        let message = format!("available commands: {}", commands.join(", "));
        self.respond(bus, false, message).await;
    }

    async fn handle_status(&self, bus: &Arc<crate::bus::EventBus>) {
        let state = self.memory.snapshot().await;
        let mode = state.mode.as_deref().unwrap_or("STARTUP");
        let message = format!(
            "mode={mode} music_playing={} current_track={}",
            state.music_playing,
            state.current_track.as_deref().unwrap_or("none")
        );
        self.respond(bus, false, message).await;
    }

    async fn handle_reset(&self, bus: &Arc<crate::bus::EventBus>) {
        self.memory.reset_to_defaults().await;
        self.respond(bus, false, "working memory reset to defaults").await;
    }

    async fn handle_quit(&self, bus: &Arc<crate::bus::EventBus>) {
        let shutdown = SystemShutdownRequestedPayload {
            reason: "user requested quit".to_string(),
            restart: false,
        };
        bus.emit(topic::SYSTEM_SHUTDOWN_REQUESTED, to_payload(&shutdown)).await;
        self.respond(bus, false, "shutting down").await;
    }
}

#[async_trait]
impl Service for CommandDispatcher {
    fn name(&self) -> &str {
        "command_dispatcher"
    }

    async fn on_start(self: &Arc<Self>, handle: &ServiceHandle) -> Result<(), KernelError> {
        let this = self.clone();
        let bus = handle.bus().clone();
        handle
            .subscribe(
                topic::CLI_COMMAND,
                Arc::new(move |payload| {
                    let this = this.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        let command: CliCommandPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid cli/command payload".to_string())?;
                        this.handle(&bus, command).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        handle
            .subscribe(
                topic::REGISTER_COMMAND,
                Arc::new(move |payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        let registration: RegisterCommandPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid register/command payload".to_string())?;
                        this.register(&registration.command, &registration.handler_service, &registration.event_topic);
                        Ok(())
                    })
                }),
            )
            .await;

        Ok(())
    }
}
