//! End-to-end scenarios, run against a fully wired
//! [`Kernel`] rather than the per-module test fakes the unit tests use.
//! STT/TTS/LLM providers are out of scope, so each test
//! stands in for them only where a scenario's setup requires it (feeding
//! `tts/audio_data` back for a `tts/generate_request`); everything else runs
//! against the real wired services.

use djr3x_kernel::bus::EventBus;
use djr3x_kernel::config::KernelConfig;
use djr3x_kernel::events::{from_payload, payloads::*, to_payload, topic};
use djr3x_kernel::kernel::Kernel;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

async fn test_kernel() -> (Arc<Kernel>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = KernelConfig::default();
    config.memory_state_path = dir.path().join("memory_state.json");
    config.timeouts.speech_wait_timeout_secs = 2;

    let kernel = Kernel::new(&config);
    kernel.start().await.unwrap();
    (kernel, dir)
}

/// Subscribe to every topic in `topics` and record `(topic, payload)` pairs
/// in delivery order.
fn recorder(bus: &Arc<EventBus>, topics: &[&str]) -> Arc<Mutex<Vec<(String, Value)>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for topic in topics {
        let log = log.clone();
        let topic = topic.to_string();
        bus.on(
            topic.clone(),
            "scenario-recorder",
            Arc::new(move |payload| {
                let log = log.clone();
                let topic = topic.clone();
                Box::pin(async move {
                    log.lock().await.push((topic, payload));
                    Ok(())
                })
            }),
        );
    }
    log
}

/// Stand in for the external TTS provider: answer every `tts/generate_request`
/// with synthetic PCM bytes sized to `duration_ms` at 16kHz mono.
fn fake_tts_provider(bus: &Arc<EventBus>, duration_ms: u64) {
    let bus_for_handler = bus.clone();
    bus.on(
        topic::TTS_GENERATE_REQUEST,
        "fake-tts-provider",
        Arc::new(move |payload| {
            let bus = bus_for_handler.clone();
            Box::pin(async move {
                let request: TtsGenerateRequestPayload =
                    from_payload(&payload).ok_or_else(|| "bad tts/generate_request".to_string())?;
                let sample_rate = 16000u32;
                let byte_count = (sample_rate as u64 * 2 * duration_ms) / 1000;
                let audio = TtsAudioDataPayload {
                    cache_key: request.cache_key,
                    audio_bytes: vec![0u8; byte_count as usize],
                    sample_rate,
                    error: None,
                };
                bus.emit(topic::TTS_AUDIO_DATA, to_payload(&audio)).await;
                Ok(())
            })
        }),
    );

    // Legacy `Speak` steps correlate on `text`, not `cache_key`, and expect
    // `speech/generation/complete` rather than `tts/audio_data`.
    let bus_for_speak = bus.clone();
    bus.on(
        topic::TTS_GENERATE_REQUEST,
        "fake-tts-provider-legacy",
        Arc::new(move |payload| {
            let bus = bus_for_speak.clone();
            Box::pin(async move {
                let request: TtsGenerateRequestPayload =
                    from_payload(&payload).ok_or_else(|| "bad tts/generate_request".to_string())?;
                if request.cache_key.is_none() {
                    let complete = SpeechGenerationCompletePayload {
                        text: request.text,
                        success: true,
                        error: None,
                    };
                    bus.emit(topic::SPEECH_GENERATION_COMPLETE, to_payload(&complete)).await;
                }
                Ok(())
            })
        }),
    );
}

fn topics_seen(log: &[(String, Value)]) -> Vec<String> {
    log.iter().map(|(t, _)| t.clone()).collect()
}

/// S1: a foreground `Speak` step (standing in for the reaction an external
/// Brain/LLM layer would drive off `llm/response`) ducks currently-playing
/// music and unducks it once `speech/generation/complete` arrives.
#[tokio::test]
async fn s1_interactive_voice_turn_ducks_and_unducks_music() {
    let (kernel, _dir) = test_kernel().await;
    fake_tts_provider(&kernel.bus, 300);

    kernel.music.play(Some("Cantina Band".to_string())).await.unwrap();
    assert!(kernel.music.is_playing().await);

    let log = recorder(
        &kernel.bus,
        &[topic::AUDIO_DUCKING_START, topic::AUDIO_DUCKING_STOP, topic::PLAN_ENDED],
    );

    let plan = Plan {
        plan_id: "s1-plan".to_string(),
        layer: PlanLayer::Foreground,
        steps: vec![PlanStep {
            id: "speak-1".to_string(),
            kind: PlanStepKind::Speak { text: "Hi traveler!".to_string() },
            delay_after_ms: None,
        }],
    };
    kernel.timeline.submit_plan(plan).await;

    tokio::time::sleep(Duration::from_millis(800)).await;

    let seen = topics_seen(&log.lock().await);
    assert_eq!(
        seen,
        vec![topic::AUDIO_DUCKING_START, topic::AUDIO_DUCKING_STOP, topic::PLAN_ENDED]
    );

    kernel.stop().await.unwrap();
}

/// S2: `system/set_mode/request {mode=AMBIENT}` while in IDLE emits the
/// transaction sequence in order and persists the new mode to memory.
#[tokio::test]
async fn s2_mode_transition_orders_events_and_persists_mode() {
    let (kernel, _dir) = test_kernel().await;
    kernel.mode_manager.request_transition(SystemMode::Idle).await.unwrap();

    let log = recorder(
        &kernel.bus,
        &[
            topic::MODE_TRANSITION_STARTED,
            topic::SYSTEM_MODE_CHANGE,
            topic::MODE_TRANSITION_COMPLETE,
            topic::SERVICE_STATUS,
        ],
    );

    kernel.mode_manager.request_transition(SystemMode::Ambient).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let entries = log.lock().await;
    let mode_manager_running_index = entries.iter().position(|(t, payload)| {
        t == topic::SERVICE_STATUS
            && from_payload::<ServiceStatusPayload>(payload)
                .map(|s| s.service == "mode_manager" && s.status == ServiceStatus::Running)
                .unwrap_or(false)
    });
    assert!(mode_manager_running_index.is_some(), "expected a mode_manager RUNNING status after the transition");

    let complete_index = entries.iter().position(|(t, _)| t == topic::MODE_TRANSITION_COMPLETE).unwrap();
    assert!(mode_manager_running_index.unwrap() > complete_index);

    let leading = &topics_seen(&entries)[..complete_index + 1];
    assert_eq!(
        leading,
        vec![
            topic::MODE_TRANSITION_STARTED.to_string(),
            topic::SYSTEM_MODE_CHANGE.to_string(),
            topic::MODE_TRANSITION_COMPLETE.to_string(),
        ]
    );

    assert_eq!(kernel.memory.get("mode", None).await, Some(Value::String("AMBIENT".to_string())));

    kernel.stop().await.unwrap();
}

/// S3: a cached-speech step followed by a delay and a crossfade on the
/// foreground layer, ducking around the cached playback and completing the
/// crossfade before the plan ends.
#[tokio::test]
async fn s3_cached_speech_then_crossfade_completes_in_order() {
    let (kernel, _dir) = test_kernel().await;
    fake_tts_provider(&kernel.bus, 500);

    kernel.music.play(Some("t1".to_string())).await.unwrap();

    // Seed the cache entry (K1, ~500ms) the way a real caller would: request
    // it once so `CachedSpeechService` round-trips through the fake TTS
    // provider and stores the result.
    let seeded = Arc::new(tokio::sync::Notify::new());
    let seeded_handler = seeded.clone();
    kernel.bus.on(
        topic::SPEECH_CACHE_READY,
        "seed-observer",
        Arc::new(move |_payload| {
            let seeded = seeded_handler.clone();
            Box::pin(async move {
                seeded.notify_one();
                Ok(())
            })
        }),
    );
    let seed_request = SpeechCacheRequestPayload {
        cache_key: "K1".to_string(),
        text: "seed".to_string(),
        metadata: Default::default(),
    };
    kernel.bus.emit(topic::SPEECH_CACHE_REQUEST, to_payload(&seed_request)).await;
    tokio::time::timeout(Duration::from_secs(2), seeded.notified()).await.unwrap();

    let log = recorder(
        &kernel.bus,
        &[
            topic::AUDIO_DUCKING_START,
            topic::SPEECH_CACHE_PLAYBACK_STARTED,
            topic::SPEECH_CACHE_PLAYBACK_COMPLETED,
            topic::AUDIO_DUCKING_STOP,
            topic::MUSIC_CROSSFADE_COMPLETE,
            topic::PLAN_ENDED,
        ],
    );

    let plan = Plan {
        plan_id: "s3-plan".to_string(),
        layer: PlanLayer::Foreground,
        steps: vec![
            PlanStep {
                id: "speech-1".to_string(),
                kind: PlanStepKind::PlayCachedSpeech { cache_key: "K1".to_string(), volume: None },
                delay_after_ms: None,
            },
            PlanStep {
                id: "delay-1".to_string(),
                kind: PlanStepKind::Delay { duration_ms: 200 },
                delay_after_ms: None,
            },
            PlanStep {
                id: "crossfade-1".to_string(),
                kind: PlanStepKind::MusicCrossfade { next_track_id: "t2".to_string(), crossfade_duration_ms: 3000 },
                delay_after_ms: None,
            },
        ],
    };
    kernel.timeline.submit_plan(plan).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let seen = topics_seen(&log.lock().await);
    assert_eq!(
        seen,
        vec![
            topic::AUDIO_DUCKING_START.to_string(),
            topic::SPEECH_CACHE_PLAYBACK_STARTED.to_string(),
            topic::SPEECH_CACHE_PLAYBACK_COMPLETED.to_string(),
            topic::AUDIO_DUCKING_STOP.to_string(),
            topic::MUSIC_CROSSFADE_COMPLETE.to_string(),
            topic::PLAN_ENDED.to_string(),
        ]
    );

    kernel.stop().await.unwrap();
}

/// S4: an override plan preempts a running ambient plan; the ambient plan is
/// cancelled before the override plan's first step, and is never resumed.
#[tokio::test]
async fn s4_override_preempts_and_cancels_ambient_without_resuming() {
    let (kernel, _dir) = test_kernel().await;

    let log = recorder(&kernel.bus, &[topic::STEP_READY, topic::PLAN_ENDED, topic::PLAN_RESUMED]);

    let ambient = Plan {
        plan_id: "A".to_string(),
        layer: PlanLayer::Ambient,
        steps: vec![PlanStep {
            id: "a-delay".to_string(),
            kind: PlanStepKind::Delay { duration_ms: 10_000 },
            delay_after_ms: None,
        }],
    };
    kernel.timeline.submit_plan(ambient).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let override_plan = Plan {
        plan_id: "O".to_string(),
        layer: PlanLayer::Override,
        steps: vec![
            PlanStep {
                id: "o-eye".to_string(),
                kind: PlanStepKind::EyePattern { pattern_name: "error".to_string() },
                delay_after_ms: None,
            },
            PlanStep {
                id: "o-delay".to_string(),
                kind: PlanStepKind::Delay { duration_ms: 500 },
                delay_after_ms: None,
            },
        ],
    };
    kernel.timeline.submit_plan(override_plan).await;

    tokio::time::sleep(Duration::from_millis(700)).await;

    let entries = log.lock().await;
    let ended_a = entries.iter().position(|(t, p)| {
        t == topic::PLAN_ENDED && from_payload::<PlanEndedPayload>(p).map(|e| e.plan_id == "A").unwrap_or(false)
    });
    let ended_o = entries.iter().position(|(t, p)| {
        t == topic::PLAN_ENDED && from_payload::<PlanEndedPayload>(p).map(|e| e.plan_id == "O").unwrap_or(false)
    });
    let first_o_step = entries.iter().position(|(t, p)| {
        t == topic::STEP_READY && from_payload::<StepReadyPayload>(p).map(|s| s.plan_id == "O").unwrap_or(false)
    });

    assert!(ended_a.unwrap() < first_o_step.unwrap(), "A must be cancelled before O's first step");
    assert!(ended_o.is_some(), "O must reach plan/ended");
    assert!(!entries.iter().any(|(t, _)| t == topic::PLAN_RESUMED), "A must not resume after preemption");

    kernel.stop().await.unwrap();
}

/// S5: a foreground plan pauses a running ambient plan and the ambient plan
/// resumes and completes once the foreground plan ends.
#[tokio::test]
async fn s5_foreground_pauses_ambient_and_resumes_it() {
    let (kernel, _dir) = test_kernel().await;

    let log = recorder(&kernel.bus, &[topic::PLAN_PAUSED, topic::PLAN_RESUMED, topic::PLAN_ENDED]);

    let ambient = Plan {
        plan_id: "A".to_string(),
        layer: PlanLayer::Ambient,
        steps: vec![
            PlanStep { id: "a1".to_string(), kind: PlanStepKind::Delay { duration_ms: 80 }, delay_after_ms: None },
            PlanStep { id: "a2".to_string(), kind: PlanStepKind::Delay { duration_ms: 80 }, delay_after_ms: None },
            PlanStep { id: "a3".to_string(), kind: PlanStepKind::Delay { duration_ms: 80 }, delay_after_ms: None },
        ],
    };
    kernel.timeline.submit_plan(ambient).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let foreground = Plan {
        plan_id: "F".to_string(),
        layer: PlanLayer::Foreground,
        steps: vec![PlanStep {
            id: "f1".to_string(),
            kind: PlanStepKind::Delay { duration_ms: 100 },
            delay_after_ms: None,
        }],
    };
    kernel.timeline.submit_plan(foreground).await;

    tokio::time::sleep(Duration::from_millis(600)).await;

    let entries = log.lock().await;
    let ended_f = entries.iter().position(|(t, p)| {
        t == topic::PLAN_ENDED && from_payload::<PlanEndedPayload>(p).map(|e| e.plan_id == "F" && e.status == PlanStatus::Completed).unwrap_or(false)
    });
    let ended_a = entries.iter().position(|(t, p)| {
        t == topic::PLAN_ENDED && from_payload::<PlanEndedPayload>(p).map(|e| e.plan_id == "A" && e.status == PlanStatus::Completed).unwrap_or(false)
    });
    assert!(ended_f.is_some(), "F must complete");
    assert!(ended_a.is_some(), "A must resume and eventually complete rather than staying paused");
    assert!(entries.iter().any(|(t, _)| t == topic::PLAN_PAUSED));
    assert!(entries.iter().any(|(t, _)| t == topic::PLAN_RESUMED));
    assert!(ended_f.unwrap() < ended_a.unwrap());

    kernel.stop().await.unwrap();
}

/// S6: one handler erroring never prevents a second handler on the same
/// topic from running, and the error is surfaced on `service/status`
/// without propagating out of `emit`.
#[tokio::test]
async fn s6_handler_error_is_isolated_from_sibling_handlers() {
    let (kernel, _dir) = test_kernel().await;

    kernel.bus.on(
        "test/event",
        "failing-handler",
        Arc::new(|_payload| Box::pin(async move { Err("boom".to_string()) })),
    );

    let appended = Arc::new(Mutex::new(Vec::new()));
    let appended_for_handler = appended.clone();
    kernel.bus.on(
        "test/event",
        "succeeding-handler",
        Arc::new(move |_payload| {
            let appended = appended_for_handler.clone();
            Box::pin(async move {
                appended.lock().await.push(());
                Ok(())
            })
        }),
    );

    let statuses = recorder(&kernel.bus, &[topic::SERVICE_STATUS]);

    let outcome = kernel.bus.emit("test/event", Value::Null).await;

    assert_eq!(appended.lock().await.len(), 1);
    assert_eq!(outcome.errors.len(), 1);

    let saw_handler_error = statuses.lock().await.iter().any(|(_, payload)| {
        from_payload::<ServiceStatusPayload>(payload)
            .map(|s| s.message.contains("HandlerError") || s.message.to_lowercase().contains("boom"))
            .unwrap_or(false)
    });
    assert!(saw_handler_error, "expected a service/status event reporting the handler error");

    kernel.stop().await.unwrap();
}
