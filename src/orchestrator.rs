//! The realtime frame loop.
//!
//! One cycle, strictly in order: acquire → perceive + evaluate → render →
//! sticky bookkeeping → persist → broadcast. Nothing in a cycle is allowed to
//! end the loop; only the shutdown flag does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;

use crate::control::CoachState;
use crate::evaluator::{palette, DrawOp, EvaluatorResult};
use crate::frame::{Frame, LatestFrame};
use crate::ingest::FrameSource;
use crate::perception::Perception;
use crate::render::{DebugHud, Hud, Renderer};
use crate::signals::FrameSignals;
use crate::storage::{NewMetric, SharedStore};

pub const TASK_PASSED: &str = "task_passed";

const BACKOFF_START: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopConfig {
    pub target_hz: u32,
    /// Payloads after the triggering one that keep carrying `task_passed`.
    pub sticky_frames: u32,
    pub session_id: String,
    pub mirror: bool,
    pub health_interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            target_hz: 20,
            sticky_frames: 6,
            session_id: "local".to_string(),
            mirror: true,
            health_interval: Duration::from_secs(5),
        }
    }
}

impl LoopConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_hz.max(1)))
    }
}

/// What observers receive once per cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LivePayload {
    pub ts: String,
    pub active_task: Option<String>,
    pub progress: f64,
    pub passed: bool,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl LivePayload {
    pub fn has_event(&self) -> bool {
        self.event.is_some()
    }
}

struct Evaluation {
    task: String,
    signals: FrameSignals,
    result: EvaluatorResult,
    first_pass: bool,
    sticky: bool,
}

/// Exponentially smoothed frames per second.
#[derive(Debug, Default)]
struct FpsMeter {
    last: Option<Instant>,
    fps: f64,
}

impl FpsMeter {
    fn tick(&mut self, now: Instant) {
        if let Some(last) = self.last {
            let dt = now.saturating_duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let inst = 1.0 / dt;
                self.fps = if self.fps == 0.0 {
                    inst
                } else {
                    0.9 * self.fps + 0.1 * inst
                };
            }
        }
        self.last = Some(now);
    }
}

pub struct Orchestrator {
    state: Arc<CoachState>,
    source: Box<dyn FrameSource>,
    perception: Perception,
    renderer: Renderer,
    store: SharedStore,
    cfg: LoopConfig,
    started: Instant,
    fps: FpsMeter,
    backoff: Duration,
    cycles: u64,
    acquire_failures: u64,
    last_health_log: Instant,
}

impl Orchestrator {
    /// `source` must already be connected.
    pub fn new(
        state: Arc<CoachState>,
        source: Box<dyn FrameSource>,
        perception: Perception,
        store: SharedStore,
        cfg: LoopConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            state,
            source,
            perception,
            renderer: Renderer::default(),
            store,
            cfg,
            started: now,
            fps: FpsMeter::default(),
            backoff: BACKOFF_START,
            cycles: 0,
            acquire_failures: 0,
            last_health_log: now,
        }
    }

    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn perception(&self) -> &Perception {
        &self.perception
    }

    /// Run until `shutdown` is set, pacing cycles to `target_hz`.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let period = self.cfg.period();
        info!(
            "frame loop running at {} Hz (sticky {} frames)",
            self.cfg.target_hz, self.cfg.sticky_frames
        );
        while !shutdown.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();
            self.cycle();
            self.maybe_log_health();
            if let Some(rest) = period.checked_sub(cycle_start.elapsed()) {
                thread::sleep(rest);
            }
        }
        info!("frame loop stopped after {} cycles", self.cycles);
    }

    pub fn spawn(mut self, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("coach-loop".to_string())
            .spawn(move || self.run(&shutdown))
            .context("spawn frame loop thread")
    }

    /// One pass of the loop. Returns the broadcast payload, or `None` when no
    /// frame could be acquired (after sleeping the current backoff).
    pub fn cycle(&mut self) -> Option<LivePayload> {
        let mut frame = self.acquire()?;
        if self.cfg.mirror {
            frame.mirror();
        }
        self.cycles += 1;
        let now = Instant::now();
        self.fps.tick(now);
        let timestamp = frame.captured_at.saturating_duration_since(self.started);

        let evaluation = self.evaluate(&frame, timestamp);
        let active_task = match &evaluation {
            Some(ev) => Some(ev.task.clone()),
            None => self.state.active_task().ok().flatten(),
        };

        self.render(&frame, evaluation.as_ref(), active_task.clone());
        self.persist(evaluation.as_ref());

        let payload = LivePayload {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            active_task,
            progress: evaluation.as_ref().map_or(0.0, |e| e.result.progress),
            passed: evaluation.as_ref().is_some_and(|e| e.result.passed),
            state: evaluation.as_ref().map_or("idle", |e| e.result.state),
            event: evaluation
                .as_ref()
                .filter(|e| e.sticky)
                .map(|_| TASK_PASSED),
            task: evaluation
                .as_ref()
                .filter(|e| e.sticky)
                .map(|e| e.task.clone()),
        };
        if let Err(e) = self.state.broadcaster().broadcast(&payload) {
            warn!("broadcast failed: {:#}", e);
        }
        Some(payload)
    }

    fn acquire(&mut self) -> Option<Frame> {
        match self.source.next_frame() {
            Ok(frame) => {
                self.backoff = BACKOFF_START;
                Some(frame)
            }
            Err(e) => {
                self.acquire_failures += 1;
                warn!(
                    "frame acquisition failed, retrying in {:?}: {:#}",
                    self.backoff, e
                );
                thread::sleep(self.backoff);
                self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
                None
            }
        }
    }

    fn evaluate(&mut self, frame: &Frame, timestamp: Duration) -> Option<Evaluation> {
        let session = self.state.session();
        let (caps, generation) = {
            let mut active = match self.state.lock_active() {
                Ok(active) => active,
                Err(e) => {
                    error!("skipping evaluation: {}", e);
                    return None;
                }
            };
            let generation = active.generation();
            (active.evaluator_mut()?.requirements(), generation)
        };

        // Perception runs outside the lock so control requests stay responsive.
        self.perception.prepare(caps);
        let signals = self.perception.sense(frame, caps, timestamp, session);

        let mut active = self.state.lock_active().ok()?;
        if active.generation() != generation {
            debug!("task switched during perception; skipping this frame");
            return None;
        }
        let task = active.task()?.to_string();
        let result = active.evaluator_mut()?.update(&signals);
        let first_pass = result.passed && !active.already_passed();
        let sticky = active.observe_pass(result.passed, self.cfg.sticky_frames);
        Some(Evaluation {
            task,
            signals,
            result,
            first_pass,
            sticky,
        })
    }

    fn render(&mut self, frame: &Frame, evaluation: Option<&Evaluation>, task: Option<String>) {
        let debug = self.state.debug_overlay();
        let session = self.state.session();
        let hud = Hud {
            task,
            progress: evaluation.map_or(0.0, |e| e.result.progress),
            state: evaluation.map_or("idle", |e| e.result.state),
            debug: debug.then_some(DebugHud {
                fps: self.fps.fps,
                session,
            }),
        };

        let mut overlay: Vec<DrawOp> = evaluation
            .map(|e| e.result.overlay.clone())
            .unwrap_or_default();
        if debug {
            if let Some(e) = evaluation {
                overlay.extend(debug_overlay(&e.signals));
            }
        }

        match self.renderer.render(frame, &overlay, &hud) {
            Ok(jpeg) => self.state.frames().publish(LatestFrame {
                jpeg: Arc::new(jpeg),
                sequence: frame.sequence,
                hud: hud.line(),
                rendered_at: Instant::now(),
            }),
            Err(e) => warn!("render failed, keeping previous frame: {:#}", e),
        }
    }

    fn persist(&mut self, evaluation: Option<&Evaluation>) {
        let Some(e) = evaluation else {
            return;
        };
        let mut progress = json!({
            "task": e.task,
            "progress": e.result.progress,
            "passed": e.result.passed,
        });
        if let Some(metrics) = &e.result.metrics {
            progress["metrics"] = metrics.clone();
        }
        let mut samples = vec![NewMetric::now(&self.cfg.session_id, "progress", progress)];
        if e.first_pass {
            info!("task '{}' passed", e.task);
            let mut passed = json!({ "task": e.task });
            if let Some(metrics) = &e.result.metrics {
                passed["metrics"] = metrics.clone();
            }
            samples.push(NewMetric::now(&self.cfg.session_id, TASK_PASSED, passed));
        }

        let mut store = match self.store.lock() {
            Ok(store) => store,
            Err(_) => {
                warn!("metric store lock poisoned; dropping sample");
                return;
            }
        };
        for sample in &samples {
            if let Err(e) = store.append(sample) {
                warn!("metric store append failed: {:#}", e);
            }
        }
    }

    fn maybe_log_health(&mut self) {
        if self.last_health_log.elapsed() < self.cfg.health_interval {
            return;
        }
        let stats = self.source.stats();
        info!(
            "health source={} healthy={} frames={} acquire_failures={} fps={:.1} subscribers={} task={}",
            stats.device,
            self.source.is_healthy(),
            stats.frames_captured,
            self.acquire_failures,
            self.fps.fps,
            self.state.broadcaster().len(),
            self.state
                .active_task()
                .ok()
                .flatten()
                .unwrap_or_else(|| "none".to_string()),
        );
        self.last_health_log = Instant::now();
    }
}

/// Raw perception markers drawn in debug mode.
fn debug_overlay(signals: &FrameSignals) -> Vec<DrawOp> {
    let mut ops = Vec::new();
    for (_, hand) in signals.hands.visible() {
        for idx in 0..crate::signals::HAND_LANDMARK_COUNT {
            if let Some(p) = hand.get(idx) {
                ops.push(DrawOp::Circle {
                    center: p,
                    radius: 2,
                    color: palette::HAND,
                    filled: true,
                });
            }
        }
    }
    if let Some(mouth) = signals.head.mouth_center {
        ops.push(DrawOp::Circle {
            center: mouth,
            radius: 4,
            color: palette::MOUTH,
            filled: true,
        });
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::TaskParams;
    use crate::ingest::{FrameSource, SyntheticSource};
    use crate::perception::{BackendRegistry, ScriptedBackend, ScriptedSignals};
    use crate::registry::TaskRegistry;
    use crate::session::SessionConfig;
    use crate::geometry::{BBox, Point};
    use crate::signals::{Detection, HandLandmarks, LandmarkMap, INDEX_TIP};
    use crate::storage::{shared, InMemoryMetricStore};

    fn rig() -> (Orchestrator, Arc<CoachState>, crate::perception::Script, SharedStore) {
        let state = Arc::new(CoachState::new(
            TaskRegistry::builtin(),
            SessionConfig::default(),
        ));
        let mut source = SyntheticSource::new("test", 320, 240);
        source.connect().unwrap();
        let (backend, script) = ScriptedBackend::new();
        let mut reg = BackendRegistry::new();
        reg.register(backend);
        let store = shared(InMemoryMetricStore::new());
        let cfg = LoopConfig {
            mirror: false,
            ..LoopConfig::default()
        };
        let orch = Orchestrator::new(
            state.clone(),
            Box::new(source),
            Perception::new(reg),
            store.clone(),
            cfg,
        );
        (orch, state, script, store)
    }

    fn touching(on: bool) -> ScriptedSignals {
        let detection = Detection::clamped(BBox::new(10, 10, 30, 30), 0.9, 320, 240);
        let tip = if on { (20, 20) } else { (300, 220) };
        ScriptedSignals {
            detection,
            hands: HandLandmarks {
                left: None,
                right: Some(LandmarkMap::from_points([(INDEX_TIP, Point::from(tip))])),
            },
            ..ScriptedSignals::default()
        }
    }

    #[test]
    fn idle_loop_broadcasts_and_publishes() {
        let (mut orch, state, _script, store) = rig();
        let (_id, rx) = state.broadcaster().subscribe_channel();
        let payload = orch.cycle().unwrap();
        assert_eq!(payload.active_task, None);
        assert_eq!(payload.state, "idle");
        assert!(!payload.has_event());
        assert!(state.frames().latest().is_some());
        let json: serde_json::Value = serde_json::from_str(&rx.recv().unwrap()).unwrap();
        assert!(json.get("event").is_none());
        assert_eq!(store.lock().unwrap().recent(10, None).unwrap().len(), 0);
    }

    #[test]
    fn sticky_event_outlives_the_pass() {
        let (mut orch, state, script, store) = rig();
        state.select_task("reach", &TaskParams::default()).unwrap();
        script.push(touching(true));
        script.extend((0..10).map(|_| touching(false)));

        let first = orch.cycle().unwrap();
        assert!(first.passed);
        assert_eq!(first.event, Some(TASK_PASSED));
        assert_eq!(first.task.as_deref(), Some("reach"));

        let rest: Vec<LivePayload> = (0..8).filter_map(|_| orch.cycle()).collect();
        assert!(rest.iter().all(|p| !p.passed));
        let carried = rest.iter().filter(|p| p.has_event()).count();
        assert_eq!(carried, 6);
        assert!(rest[..6].iter().all(LivePayload::has_event));

        let samples = store.lock().unwrap().recent(100, None).unwrap();
        assert_eq!(samples.iter().filter(|s| s.kind == TASK_PASSED).count(), 1);
        assert_eq!(samples.iter().filter(|s| s.kind == "progress").count(), 9);
    }

    #[test]
    fn acquisition_failure_backs_off_without_payload() {
        let state = Arc::new(CoachState::new(
            TaskRegistry::builtin(),
            SessionConfig::default(),
        ));
        let mut source = SyntheticSource::new("flaky", 16, 16).with_fail_every(1);
        source.connect().unwrap();
        let mut orch = Orchestrator::new(
            state,
            Box::new(source),
            Perception::new(BackendRegistry::new()),
            shared(InMemoryMetricStore::new()),
            LoopConfig::default(),
        );
        assert!(orch.cycle().is_none());
        assert_eq!(orch.backoff, Duration::from_millis(100));
        assert!(orch.cycle().is_none());
        assert_eq!(orch.backoff, Duration::from_millis(200));
        assert_eq!(orch.cycles(), 0);
    }

    #[test]
    fn run_stops_on_shutdown() {
        let (orch, _state, _script, _store) = rig();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = orch.spawn(shutdown.clone()).unwrap();
        thread::sleep(Duration::from_millis(120));
        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
