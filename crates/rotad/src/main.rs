use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use rota_core::RotaConfig;
use rota_rotations::{Rotation, RotationKey};
use rota_scheduler::{hour_bucket, plan_events, TickLoop, TickProcessor};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod app;
mod cli;

use app::App;
use cli::{Cli, Commands, OverrideSubcommand, RotationSubcommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // config: --config / ROTA_CONFIG > ~/.rota/rota.toml, then ROTA_* env overrides
    let config = RotaConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("Config load failed ({e}), using defaults");
        RotaConfig::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.filter.as_str().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let app = App::open(config)?;

    match cli.command {
        Commands::Run => run(app).await,
        Commands::Tick { team } => {
            let report = app
                .tick_processor(None)
                .process_tick(&team, &CancellationToken::new())
                .await?;
            print_json(&report)
        }
        Commands::Rotation { subcommand } => rotation(&app, subcommand),
        Commands::Override { subcommand } => overrides(&app, subcommand),
        Commands::Events { hour } => {
            let hour = hour.unwrap_or_else(|| hour_bucket(Utc::now()));
            print_json(&app.index.get_events_by_hour(&hour)?)
        }
        Commands::Purge => {
            let removed = app.index.purge_expired(Utc::now())?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
    }
}

/// Tick loop in the foreground; notifications are logged until delivery is wired up.
async fn run(app: App) -> anyhow::Result<()> {
    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel::<rota_scheduler::Notification>(256);
    tokio::spawn(async move {
        while let Some(n) = notify_rx.recv().await {
            info!(
                rotation_id = %n.rotation_id,
                action = %n.action,
                owner = %n.owner,
                channel = %n.target_channel,
                "notification ready for delivery"
            );
        }
    });

    let processor: Arc<dyn TickProcessor> = Arc::new(app.tick_processor(Some(notify_tx)));
    let tick_loop = TickLoop::new(processor, app.index.clone(), &app.config.scheduler);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { tick_loop.run(shutdown_rx).await });
    info!("rotad running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    if let Err(e) = handle.await {
        warn!("tick loop task failed: {e}");
    }
    Ok(())
}

fn rotation(app: &App, cmd: RotationSubcommand) -> anyhow::Result<()> {
    match cmd {
        RotationSubcommand::Get { team, label } => {
            print_json(&app.rotations.get_rotation(&RotationKey::new(team, label))?)
        }
        RotationSubcommand::List {
            team,
            page_size,
            cursor,
        } => print_json(&app.rotations.list_rotations(&team, page_size, cursor.as_deref())?),
        RotationSubcommand::Create {
            team,
            label,
            owners,
            frequency,
            starts_at,
            channel,
        } => {
            let r = Rotation::new(
                RotationKey::new(team, label),
                owners,
                frequency,
                starts_at.unwrap_or_else(Utc::now),
            );
            let stored = app.rotations.upsert_rotation(r, &CancellationToken::new())?;
            let channel = channel.or_else(|| app.config.scheduler.default_channel.clone());
            if let Some(channel) = channel {
                let s = &app.config.scheduler;
                for event in plan_events(
                    &stored,
                    &channel,
                    chrono::Duration::hours(s.reminder_lead_hours),
                    chrono::Duration::hours(s.event_ttl_hours),
                ) {
                    app.index.add_event(&event)?;
                }
            }
            print_json(&stored)
        }
        RotationSubcommand::Advance { team, label } => {
            let key = RotationKey::new(team, label);
            print_json(&app.rotations.advance_rotation(&key, &CancellationToken::new())?)
        }
    }
}

fn overrides(app: &App, cmd: OverrideSubcommand) -> anyhow::Result<()> {
    let m = &app.overrides;
    let cancel = CancellationToken::new();
    match cmd {
        OverrideSubcommand::Create {
            requested_by,
            start,
            end,
        } => {
            let clashes = m.overlapping(start, end)?;
            if !clashes.is_empty() {
                warn!(count = clashes.len(), "override overlaps existing requests");
            }
            print_json(&m.create_override(&requested_by, start, end, &cancel)?)
        }
        OverrideSubcommand::Get { id } => print_json(&m.get_override(&id)?),
        OverrideSubcommand::List { status } => print_json(&m.list_overrides(status)?),
        OverrideSubcommand::Approve { id, by } => print_json(&m.approve(&id, &by, &cancel)?),
        OverrideSubcommand::Reject { id, by } => print_json(&m.reject(&id, &by, &cancel)?),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
