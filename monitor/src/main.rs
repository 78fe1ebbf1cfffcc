use std::{
    fs,
    io::stdout,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use engine::{
    AlertCoalescer, AlertFilter, Database, DatabaseEvent, FallAlert, Monitor, Settings,
};
use fern::Dispatch;
use log::{LevelFilter, info, warn};
use replay::ReplaySource;
use tokio::{sync::broadcast::error::RecvError, task::spawn_blocking};

mod replay;

/// Tracks fallen people from detector output and records fall alerts.
#[derive(Debug, Parser)]
#[command(name = "monitor", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replays a JSON lines recording of detections through the tracker.
    Replay {
        file: PathBuf,
        #[arg(long, default_value = "alerts.db")]
        db: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Alert category, defaults to the configured one.
        #[arg(long)]
        source: Option<String>,
        /// Paces frames at the configured FPS.
        #[arg(long)]
        realtime: bool,
    },
    /// Lists stored alerts, newest first.
    Alerts {
        #[arg(long, default_value = "alerts.db")]
        db: PathBuf,
        /// Only alerts not yet acknowledged.
        #[arg(long)]
        pending: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        include_tests: bool,
    },
    /// Acknowledges an alert.
    Ack {
        id: i64,
        #[arg(long, default_value = "alerts.db")]
        db: PathBuf,
        #[arg(long)]
        user: String,
        /// Whether the alert was a real fall.
        #[arg(long)]
        accurate: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let level = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(stdout())
        .apply()?;
    log_panics::init();

    match Cli::parse().command {
        Command::Replay {
            file,
            db,
            config,
            source,
            realtime,
        } => replay(&file, &db, config.as_deref(), source, realtime).await,
        Command::Alerts {
            db,
            pending,
            limit,
            include_tests,
        } => {
            let db = open_database(&db)?;
            let alerts = db.query_alerts(&AlertFilter {
                acknowledged: pending.then_some(false),
                include_tests,
                limit,
                ..Default::default()
            })?;
            if alerts.is_empty() {
                println!("No alerts");
            }
            for alert in alerts.iter() {
                println!("{}", format_alert(alert));
            }
            Ok(())
        }
        Command::Ack {
            id,
            db,
            user,
            accurate,
        } => {
            if user.trim().is_empty() {
                bail!("user must not be empty");
            }
            let alert = open_database(&db)?
                .acknowledge_alert(id, &user, SystemTime::now(), accurate)
                .with_context(|| format!("failed to acknowledge alert {id}"))?;
            println!("{}", format_alert(&alert));
            Ok(())
        }
    }
}

async fn replay(
    file: &Path,
    db: &Path,
    config: Option<&Path>,
    source: Option<String>,
    realtime: bool,
) -> Result<()> {
    let mut settings = match config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(source) = source {
        settings.alerts.category = source;
    }
    let contents = fs::read_to_string(file)
        .with_context(|| format!("failed to read recording {}", file.display()))?;

    let db = open_database(db)?;
    let mut events = db.subscribe();
    let coalescer = Arc::new(AlertCoalescer::from_settings(db, &settings.alerts));
    let mut monitor = Monitor::from_settings(&settings, coalescer);
    let fps = realtime.then_some(settings.monitor.fps);

    let events_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DatabaseEvent::AlertCreated(alert)) => {
                    info!(target: "monitor", "new alert {}", format_alert(&alert));
                }
                Ok(DatabaseEvent::AlertUpdated(alert)) => {
                    info!(target: "monitor", "updated alert {}", format_alert(&alert));
                }
                Ok(DatabaseEvent::AlertDeleted(id)) => {
                    info!(target: "monitor", "deleted alert {id}");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "monitor", "missed {skipped} alert events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (frames, monitor) = spawn_blocking(move || {
        let mut source = ReplaySource::new(&contents);
        let frames = monitor.run(&mut source, fps, |report| {
            for evicted in report.evicted.iter() {
                info!(target: "monitor", "{evicted} left the scene");
            }
        })?;

        Ok::<_, engine::Error>((frames, monitor))
    })
    .await??;
    let urgent = monitor.registry().has_urgent_cases();
    // Drops the last sender so the event task ends
    drop(monitor);
    events_task.await?;

    info!(target: "monitor", "replayed {frames} frames");
    if urgent {
        warn!(target: "monitor", "replay ended with urgent cases still tracked");
    }
    Ok(())
}

fn open_database(path: &Path) -> Result<Database> {
    Database::open(path).with_context(|| format!("failed to open database {}", path.display()))
}

fn format_alert(alert: &FallAlert) -> String {
    let status = if alert.acknowledged {
        format!(
            "acknowledged by {}",
            alert.acknowledged_by.as_deref().unwrap_or("unknown")
        )
    } else {
        "new".to_string()
    };
    let accuracy = match alert.is_accurate {
        Some(true) => ", accurate",
        Some(false) => ", false positive",
        None => "",
    };

    format!(
        "#{} {} [{}] {} {} confidence {}{} ({}{})",
        alert.id.unwrap_or_default(),
        humantime::format_rfc3339_seconds(alert.timestamp),
        alert.detected_by,
        alert.urgency_display(),
        alert.subject.as_deref().unwrap_or("-"),
        alert
            .confidence
            .map(|confidence| format!("{confidence:.2}"))
            .unwrap_or_else(|| "-".to_string()),
        alert
            .time_on_ground_secs
            .map(|secs| format!(", {secs:.0}s on the ground"))
            .unwrap_or_default(),
        status,
        accuracy
    )
}
