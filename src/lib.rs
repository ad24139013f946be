//! Rehab CV Coach
//!
//! A realtime exercise coach for upper-limb rehabilitation. A camera frame
//! flows through perception (object detection, hand landmarks, head metrics),
//! into the evaluator for the selected task, and out as an annotated preview
//! frame plus a live telemetry payload.
//!
//! # Module Structure
//!
//! - `evaluator`: per-task state machines (`reach`, `grab_hold`, `lift_to_mouth`,
//!   `hold_at_mouth`, `dump_into_mouth`, `place_cup_down`)
//! - `registry`: task identifiers and aliases to evaluator constructors
//! - `perception`: backend trait, backend registry, and the fault-isolating facade
//! - `ingest`: frame sources (`stub://` synthetic, V4L2 behind a feature)
//! - `orchestrator`: the 20 Hz frame loop and sticky `task_passed` event
//! - `control`: shared state mutated by the control surface
//! - `broadcast`: best-effort fan-out of live payloads
//! - `api`: local HTTP control surface, SSE live channel, MJPEG preview
//! - `storage`: append-only metric samples (SQLite)

pub mod api;
pub mod broadcast;
pub mod config;
pub mod control;
pub mod error;
pub mod evaluator;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod orchestrator;
pub mod perception;
pub mod registry;
pub mod render;
pub mod session;
pub mod signals;
pub mod storage;
pub mod ui;

pub use broadcast::{Broadcaster, Subscriber};
pub use control::CoachState;
pub use error::ControlError;
pub use evaluator::{DrawOp, Evaluator, EvaluatorResult, TaskParams};
pub use frame::{Frame, LatestFrame};
pub use orchestrator::{LivePayload, LoopConfig, Orchestrator, TASK_PASSED};
pub use registry::TaskRegistry;
pub use session::{SessionConfig, SessionUpdate, TargetMode};
pub use signals::{Detection, FrameSignals, HandLandmarks, HandSide, HeadMetrics};
pub use storage::{MetricSample, MetricStore, SqliteMetricStore};
