//! coachd - Rehab CV Coach daemon
//!
//! This daemon:
//! 1. Opens the metric store and the camera source
//! 2. Registers perception backends (stub, plus an ONNX detector when built with `backend-tract`)
//! 3. Serves the local control API, live telemetry, and MJPEG preview
//! 4. Runs the frame loop until Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use rehab_coach::api::{ApiConfig, ApiServer};
use rehab_coach::config::CoachdConfig;
use rehab_coach::ingest::open_source;
use rehab_coach::perception::{BackendRegistry, Perception, StubBackend};
use rehab_coach::storage::{shared, SqliteMetricStore};
use rehab_coach::ui::{Ui, UiMode};
use rehab_coach::{CoachState, Orchestrator, TaskParams, TaskRegistry};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (.toml or JSON). Overrides COACH_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Control API listen address.
    #[arg(long)]
    addr: Option<String>,
    /// Camera URL: stub://name or /dev/videoN.
    #[arg(long)]
    camera: Option<String>,
    /// Metric store path.
    #[arg(long)]
    db: Option<String>,
    /// Task to select at startup.
    #[arg(long)]
    task: Option<String>,
    /// Start with the debug overlay enabled.
    #[arg(long)]
    debug_overlay: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = Ui::detect(args.ui.parse::<UiMode>()?);

    let cfg = {
        let _stage = ui.stage("Load config");
        let env_path = std::env::var("COACH_CONFIG").ok().map(PathBuf::from);
        let mut cfg = CoachdConfig::load_from(args.config.as_deref().or(env_path.as_deref()))?;
        if let Some(addr) = args.addr {
            cfg.api_addr = addr;
        }
        if let Some(url) = args.camera {
            cfg.camera.url = url;
        }
        if let Some(db) = args.db {
            cfg.db_path = db;
        }
        cfg
    };

    let store = {
        let mut stage = ui.stage("Open metric store");
        let store = SqliteMetricStore::open(&cfg.db_path)?;
        stage.detail(cfg.db_path.clone());
        shared(store)
    };

    let source = {
        let mut stage = ui.stage("Connect camera");
        let mut source = open_source(&cfg.camera)?;
        source.connect()?;
        stage.detail(cfg.camera.url.clone());
        source
    };

    let perception = {
        let mut stage = ui.stage("Register perception backends");
        let registry = build_backends(&cfg)?;
        stage.detail(registry.list().join(", "));
        Perception::new(registry)
    };

    let state = Arc::new(CoachState::new(TaskRegistry::builtin(), cfg.session));
    state.set_debug_overlay(args.debug_overlay);
    if let Some(task) = args.task.as_deref() {
        state
            .select_task(task, &TaskParams::default())
            .map_err(|e| anyhow!("--task: {}", e))?;
    }

    let api_handle = {
        let mut stage = ui.stage("Start control API");
        let handle = ApiServer::new(
            ApiConfig {
                addr: cfg.api_addr.clone(),
            },
            state.clone(),
            store.clone(),
        )
        .spawn()?;
        stage.detail(format!("http://{}", handle.addr));
        handle
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let orchestrator = Orchestrator::new(state, source, perception, store, cfg.loop_config());
    let loop_handle = orchestrator.spawn(shutdown.clone())?;
    ui.note(&format!(
        "coachd running: session={} camera={} target={} Hz",
        cfg.session_id, cfg.camera.url, cfg.target_hz
    ));

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping frame loop and API...");
    shutdown.store(true, Ordering::SeqCst);
    loop_handle
        .join()
        .map_err(|_| anyhow!("frame loop thread panicked"))?;
    api_handle.stop()?;
    Ok(())
}

#[cfg(feature = "backend-tract")]
fn build_backends(cfg: &CoachdConfig) -> Result<BackendRegistry> {
    use rehab_coach::perception::backends::TractDetector;

    let mut registry = BackendRegistry::new();
    if let Some(path) = &cfg.detector.model_path {
        let detector = TractDetector::new(path, cfg.detector.input_width, cfg.detector.input_height)?
            .with_threshold(cfg.detector.confidence)
            .with_target_class(cfg.detector.target_class);
        registry.register(detector);
    }
    registry.register(StubBackend::new());
    Ok(registry)
}

#[cfg(not(feature = "backend-tract"))]
fn build_backends(cfg: &CoachdConfig) -> Result<BackendRegistry> {
    if let Some(path) = &cfg.detector.model_path {
        log::warn!(
            "detector model {} ignored: built without the backend-tract feature",
            path.display()
        );
    }
    let mut registry = BackendRegistry::new();
    registry.register(StubBackend::new());
    Ok(registry)
}
