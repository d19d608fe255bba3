use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use hsd_core::{
    Availability, BookingOrigin, CompletionEvidence, GeoPoint, Location, PricingMode,
    VerificationStatus, WorkerProfile,
};
use hsd_engine::{BookingRequest, DispatchEngine, EngineConfig, SearchOutcome};
use hsd_store::MemoryStore;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "hsd-cli")]
#[command(about = "Home service dispatch command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a full match/accept/complete scenario against the in-memory store.
    Demo,
    /// Run one expiration sweep and exit.
    Sweep,
    /// Run the cron-scheduled sweeps until interrupted.
    Scheduler,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Demo) {
        Commands::Demo => run_demo().await,
        Commands::Sweep => run_sweep_once().await,
        Commands::Scheduler => run_scheduler().await,
    }
}

fn engine_from_env() -> DispatchEngine {
    let store = Arc::new(MemoryStore::new());
    DispatchEngine::new(store, EngineConfig::from_env())
}

async fn run_demo() -> Result<()> {
    let engine = engine_from_env();

    let worker = engine
        .register_worker(WorkerProfile {
            id: String::new(),
            skills: vec!["plumbing".into()],
            availability: Availability::Online,
            verification_status: VerificationStatus::Verified,
            location: GeoPoint {
                lat: 6.9350,
                lng: 79.8612,
            },
            rating: 4.8,
            current_job_id: None,
            jobs_completed: 0,
            monthly_earnings: 0.0,
        })
        .await?;
    info!(worker_id = %worker.id, "worker registered");

    let booking = engine
        .create_booking(BookingRequest {
            client_id: "demo-client".into(),
            category_id: "cat-plumbing".into(),
            category_name: "Plumbing".into(),
            sub_service: "Leak Repair".into(),
            location: Location {
                lat: 6.9271,
                lng: 79.8612,
                address: "12 Galle Rd, Colombo".into(),
            },
            schedule_date: None,
            schedule_time: None,
            base_price: 500.0,
            pricing_mode: PricingMode::Hourly,
            origin: BookingOrigin::Instant,
        })
        .await?;
    println!("booking created: id={} status={:?}", booking.id, booking.status);

    match engine.find_and_dispatch(&booking.id).await? {
        SearchOutcome::Dispatched { radius_km, offers } => {
            println!("dispatched {offers} offer(s) at {radius_km} km");
        }
        other => bail!("demo search did not dispatch: {other:?}"),
    }

    let outcome = engine.accept(&booking.id, &worker.id).await?;
    println!("accept: won={}", outcome.won);

    engine.start_travel(&booking.id, &worker.id).await?;
    engine.mark_arrived(&booking.id, &worker.id).await?;
    engine.start_job(&booking.id, &worker.id).await?;
    engine
        .complete_job(
            &booking.id,
            &worker.id,
            CompletionEvidence {
                artifact_ref: "demo/after.jpg".into(),
                reported_duration_secs: 0,
            },
        )
        .await?;

    let booking = engine.booking(&booking.id).await?;
    let worker = engine.worker(&worker.id).await?;
    println!("final status: {:?}", booking.status);
    if let Some(final_pricing) = booking.final_pricing {
        println!(
            "final pricing: total={} worker_earnings={}",
            final_pricing.total, final_pricing.worker_earnings
        );
    }
    println!(
        "worker settled: jobs_completed={} monthly_earnings={}",
        worker.jobs_completed, worker.monthly_earnings
    );
    Ok(())
}

async fn run_sweep_once() -> Result<()> {
    let engine = engine_from_env();
    let report = engine.sweep().await?;
    let stale = engine
        .sweep_stale(engine.config().stale_age)
        .await?;
    println!(
        "sweep complete: expired_deleted={} stale_deleted={} errors={}",
        report.deleted,
        stale.deleted,
        report.errors.len() + stale.errors.len()
    );
    Ok(())
}

async fn run_scheduler() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        scheduler_enabled: true,
        ..EngineConfig::from_env()
    };
    let engine = DispatchEngine::new(store, config);

    let Some(sched) = engine.maybe_build_scheduler().await? else {
        bail!("scheduler disabled by configuration");
    };
    sched.start().await?;
    info!(cron = %engine.config().sweep_cron, "sweep scheduler running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    // Give in-flight sweep ticks a moment to finish logging.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
