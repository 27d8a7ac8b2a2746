//! Trigger behavior through the engine: time schedules, holds, rising edges,
//! execution modes and reloads

use chrono::{DateTime, Local, TimeZone, Utc};
use ha_host::Host;
use ha_trigger::{
    handler_fn, CollectingSink, EngineConfig, ExecutionMode, ManualClock, TriggerArgs,
    TriggerEngine, TriggerType,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// Harness
// ============================================================================

struct Fixture {
    engine: TriggerEngine,
    sink: Arc<CollectingSink>,
    calls: mpsc::UnboundedReceiver<TriggerArgs>,
}

/// Engine with `file.test.f` recording every call
fn fixture(config: EngineConfig, clock: Option<Arc<ManualClock>>) -> Fixture {
    let sink = Arc::new(CollectingSink::new());
    let mut engine = TriggerEngine::new(Arc::new(Host::new()), config).with_sink(sink.clone());
    if let Some(clock) = clock {
        engine = engine.with_clock(clock);
    }
    let (tx, calls) = mpsc::unbounded_channel();
    engine.register_handler(
        "file.test.f",
        handler_fn(move |args| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(args);
                Ok(())
            }
        }),
    );
    Fixture {
        engine,
        sink,
        calls,
    }
}

fn local(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Local
        .with_ymd_and_hms(2020, 7, 1, h, m, s)
        .earliest()
        .expect("valid local time")
        .with_timezone(&Utc)
}

/// Let watcher tasks catch up with what the test just did
async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

async fn next_call(calls: &mut mpsc::UnboundedReceiver<TriggerArgs>) -> TriggerArgs {
    tokio::time::timeout(Duration::from_secs(2), calls.recv())
        .await
        .expect("handler was not called")
        .unwrap()
}

async fn no_call(calls: &mut mpsc::UnboundedReceiver<TriggerArgs>) {
    settle().await;
    assert!(calls.try_recv().is_err(), "unexpected handler call");
}

// ============================================================================
// Time triggers
// ============================================================================

#[tokio::test]
async fn test_time_trigger_once() {
    let clock = Arc::new(ManualClock::at(local(10, 59, 59)));
    let mut f = fixture(EngineConfig::default(), Some(clock.clone()));
    f.engine
        .load_script(
            "file.test",
            "@time_trigger(\"once(11:00)\")\ndef f(trigger_type=None, trigger_time=None):\n    pass\n",
        )
        .await
        .unwrap();
    settle().await;
    no_call(&mut f.calls).await;

    clock.advance_seconds(1);
    let args = next_call(&mut f.calls).await;
    assert_eq!(args.trigger_type, TriggerType::Time);
    assert_eq!(args.trigger_time, Some(local(11, 0, 0)));

    // Next occurrence is tomorrow
    clock.advance_minutes(30);
    no_call(&mut f.calls).await;
}

#[tokio::test]
async fn test_time_trigger_period() {
    let clock = Arc::new(ManualClock::at(local(10, 59, 59)));
    let mut f = fixture(EngineConfig::default(), Some(clock.clone()));
    f.engine
        .load_script(
            "file.test",
            "@time_trigger(\"period(11:00, 10m)\")\ndef f():\n    pass\n",
        )
        .await
        .unwrap();
    settle().await;

    clock.advance_seconds(1);
    assert_eq!(next_call(&mut f.calls).await.trigger_time, Some(local(11, 0, 0)));
    settle().await;

    clock.advance_minutes(5);
    no_call(&mut f.calls).await;

    clock.advance_minutes(5);
    assert_eq!(next_call(&mut f.calls).await.trigger_time, Some(local(11, 10, 0)));
}

#[tokio::test]
async fn test_time_active_guard() {
    let clock = Arc::new(ManualClock::at(local(10, 0, 0)));
    let mut f = fixture(EngineConfig::default(), Some(clock.clone()));
    f.engine
        .load_script(
            "file.test",
            "@event_trigger(\"ping\")\n@time_active(\"range(08:00, 09:00)\")\ndef f():\n    pass\n",
        )
        .await
        .unwrap();

    f.engine.host().fire_event("ping", serde_json::json!({}));
    no_call(&mut f.calls).await;

    clock.set(local(8, 30, 0));
    f.engine.host().fire_event("ping", serde_json::json!({}));
    assert_eq!(next_call(&mut f.calls).await.trigger_type, TriggerType::Event);
}

#[tokio::test]
async fn test_startup_and_shutdown() {
    let mut f = fixture(EngineConfig::default(), None);
    f.engine
        .load_script(
            "file.test",
            "@time_trigger(\"startup\", \"shutdown\")\ndef f():\n    pass\n",
        )
        .await
        .unwrap();

    f.engine.host().start();
    assert_eq!(next_call(&mut f.calls).await.trigger_type, TriggerType::Time);
    no_call(&mut f.calls).await;

    f.engine.host().stop();
    assert_eq!(next_call(&mut f.calls).await.trigger_type, TriggerType::Time);
}

// ============================================================================
// State triggers
// ============================================================================

#[tokio::test]
async fn test_state_hold() {
    let clock = Arc::new(ManualClock::at(local(12, 0, 0)));
    let mut f = fixture(EngineConfig::default(), Some(clock.clone()));
    f.engine
        .load_script(
            "file.test",
            "@state_trigger(\"pyscript.door == 'open'\", state_hold=5)\ndef f():\n    pass\n",
        )
        .await
        .unwrap();
    let states = f.engine.host().states().clone();

    states.set_value("pyscript.door", "open").unwrap();
    settle().await;
    clock.advance_seconds(4);
    no_call(&mut f.calls).await;

    // Going false breaks the hold
    states.set_value("pyscript.door", "closed").unwrap();
    settle().await;
    clock.advance_seconds(2);
    no_call(&mut f.calls).await;

    states.set_value("pyscript.door", "open").unwrap();
    settle().await;
    clock.advance_seconds(5);
    let args = next_call(&mut f.calls).await;
    assert_eq!(args.var_name.as_deref(), Some("pyscript.door"));
    assert_eq!(args.value.as_deref(), Some("open"));
}

#[tokio::test]
async fn test_state_hold_false_rising_edge() {
    let mut f = fixture(EngineConfig::default(), None);
    f.engine
        .load_script(
            "file.test",
            "@state_trigger(\"int(pyscript.temp) > 20\", state_hold_false=0)\ndef f():\n    pass\n",
        )
        .await
        .unwrap();
    let states = f.engine.host().states().clone();

    states.set_value("pyscript.temp", "25").unwrap();
    assert_eq!(next_call(&mut f.calls).await.value.as_deref(), Some("25"));

    states.set_value("pyscript.temp", "26").unwrap();
    no_call(&mut f.calls).await;

    states.set_value("pyscript.temp", "10").unwrap();
    no_call(&mut f.calls).await;

    states.set_value("pyscript.temp", "30").unwrap();
    assert_eq!(next_call(&mut f.calls).await.value.as_deref(), Some("30"));
}

#[tokio::test]
async fn test_state_check_now() {
    let host = Arc::new(Host::new());
    host.states().set_value("pyscript.mode", "away").unwrap();
    let (tx, mut calls) = mpsc::unbounded_channel();
    let engine = TriggerEngine::new(host, EngineConfig::default());
    engine.register_handler(
        "file.test.f",
        handler_fn(move |args| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(args);
                Ok(())
            }
        }),
    );
    engine
        .load_script(
            "file.test",
            "@state_trigger(\"pyscript.mode == 'away'\", state_check_now=True)\ndef f():\n    pass\n",
        )
        .await
        .unwrap();

    let args = next_call(&mut calls).await;
    assert_eq!(args.trigger_type, TriggerType::State);
    assert_eq!(args.var_name, None);
}

// ============================================================================
// Execution modes
// ============================================================================

/// Engine whose `file.test.f` sleeps, tracking overlap
fn slow_engine(mode: ExecutionMode) -> (TriggerEngine, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let config = EngineConfig {
        handler_mode: mode,
        ..Default::default()
    };
    let engine = TriggerEngine::new(Arc::new(Host::new()), config);
    let started = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicUsize::new(0));
    {
        let (started, peak) = (started.clone(), peak.clone());
        engine.register_handler(
            "file.test.f",
            handler_fn(move |_| {
                let (started, peak, running) = (started.clone(), peak.clone(), running.clone());
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
    }
    (engine, started, peak)
}

const PING: &str = "@event_trigger(\"ping\")\ndef f():\n    pass\n";

#[tokio::test]
async fn test_single_mode_drops_overlapping_runs() {
    let (engine, started, peak) = slow_engine(ExecutionMode::Single);
    engine.load_script("file.test", PING).await.unwrap();
    for _ in 0..3 {
        engine.host().fire_event("ping", serde_json::json!({}));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_queued_mode_serializes_runs() {
    let (engine, started, peak) = slow_engine(ExecutionMode::Queued { max: 10 });
    engine.load_script("file.test", PING).await.unwrap();
    for _ in 0..3 {
        engine.host().fire_event("ping", serde_json::json!({}));
    }
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(started.load(Ordering::SeqCst), 3);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_parallel_mode_overlaps_runs() {
    let (engine, started, peak) = slow_engine(ExecutionMode::Parallel { max: 64 });
    engine.load_script("file.test", PING).await.unwrap();
    for _ in 0..3 {
        engine.host().fire_event("ping", serde_json::json!({}));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(started.load(Ordering::SeqCst), 3);
    assert!(peak.load(Ordering::SeqCst) > 1);
}

// ============================================================================
// Reload
// ============================================================================

#[tokio::test]
async fn test_reload_replaces_watchers() {
    let mut f = fixture(EngineConfig::default(), None);
    f.engine.load_script("file.test", PING).await.unwrap();
    f.engine.host().fire_event("ping", serde_json::json!({}));
    next_call(&mut f.calls).await;

    f.engine
        .reload_script(
            "file.test",
            "@event_trigger(\"pong\", kwargs={\"n\": 2})\ndef f():\n    pass\n",
        )
        .await
        .unwrap();
    f.engine.host().fire_event("ping", serde_json::json!({}));
    no_call(&mut f.calls).await;

    f.engine.host().fire_event("pong", serde_json::json!({}));
    let args = next_call(&mut f.calls).await;
    assert_eq!(args.event_type.as_deref(), Some("pong"));
    assert_eq!(args.kwargs["n"], 2);

    f.engine.unload_all().await;
    assert_eq!(f.engine.watcher_count(), 0);
    assert!(f.sink.diagnostics().is_empty());
}
