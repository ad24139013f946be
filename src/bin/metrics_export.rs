//! metrics_export - print the newest metric samples as JSON

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::Write;

use rehab_coach::config::validate_session_id;
use rehab_coach::storage::{MetricStore, SqliteMetricStore, MAX_RECENT};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the metric store.
    #[arg(long, env = "COACH_DB_PATH", default_value = "coach.db")]
    db: String,
    /// Number of samples, newest first.
    #[arg(long, default_value_t = 500)]
    limit: usize,
    /// Only samples from this session.
    #[arg(long)]
    session: Option<String>,
    /// Pretty-print the JSON.
    #[arg(long)]
    pretty: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if args.limit > MAX_RECENT {
        return Err(anyhow!("--limit must be at most {}", MAX_RECENT));
    }
    if let Some(session) = args.session.as_deref() {
        validate_session_id(session)?;
    }
    if !args.db.starts_with("file:") && !std::path::Path::new(&args.db).exists() {
        return Err(anyhow!("metric store {} does not exist", args.db));
    }

    let mut store = SqliteMetricStore::open(&args.db)?;
    let samples = store.recent(args.limit, args.session.as_deref())?;
    log::info!("exporting {} samples from {}", samples.len(), args.db);

    let json = if args.pretty {
        serde_json::to_string_pretty(&samples)?
    } else {
        serde_json::to_string(&samples)?
    };
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", json)?;
    Ok(())
}
