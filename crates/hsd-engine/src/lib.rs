//! Matching, dispatch, acceptance arbitration, booking lifecycle, and
//! expiration sweeps for HSD.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use hsd_core::{
    distance_km, Booking, BookingOrigin, BookingStatus, CompletionEvidence, FinalPricing,
    JobOffer, Location, OfferPayload, Pricing, PricingMode, WorkerProfile,
};
use hsd_store::{DocumentStore, Filter, StoreError, Subscription};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "hsd-engine";

pub const BOOKINGS: &str = "bookings";
pub const WORKERS: &str = "workers";
pub const NOTIFICATIONS: &str = "notifications";

/// Cancellation fee schedule, as fractions of the booking total.
const CANCEL_FEE_SEARCHING_RATE: f64 = 0.05;
const CANCEL_FEE_EARLY_RATE: f64 = 0.10;
const CANCEL_FEE_LATE_RATE: f64 = 0.20;
const FREE_CANCEL_WINDOW_SECS: i64 = 3600;
const LATE_CANCEL_THRESHOLD_SECS: i64 = 7200;

/// Largest gap tolerated between the worker-reported duration and the job
/// timer before the completion is refused.
const REPORTED_DURATION_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("cannot {action} from {from:?}")]
    InvalidTransition {
        from: BookingStatus,
        action: &'static str,
    },
    #[error("actor {actor_id} may not act on booking {booking_id}")]
    Forbidden { booking_id: String, actor_id: String },
    #[error("data integrity anomaly: {0}")]
    DataIntegrity(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn map_lookup(kind: &'static str, id: &str, err: StoreError) -> EngineError {
    match err {
        StoreError::NotFound { .. } => EngineError::NotFound {
            kind,
            id: id.to_string(),
        },
        other => EngineError::Store(other),
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub initial_radius_km: f64,
    pub radius_step_km: f64,
    pub max_radius_km: f64,
    pub retry_delay: Duration,
    pub offer_window: Duration,
    pub accept_deadline: Duration,
    pub stale_age: Duration,
    pub sweep_cron: String,
    pub scheduler_enabled: bool,
    /// Synonym table for skill matching: alias -> canonical token.
    pub skill_aliases: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_radius_km: 3.0,
            radius_step_km: 2.0,
            max_radius_km: 15.0,
            retry_delay: Duration::from_secs(5),
            offer_window: Duration::from_secs(90),
            accept_deadline: Duration::from_secs(120),
            stale_age: Duration::from_secs(24 * 3600),
            sweep_cron: "0 0 * * * *".to_string(),
            scheduler_enabled: false,
            skill_aliases: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            initial_radius_km: env_parse("HSD_INITIAL_RADIUS_KM", defaults.initial_radius_km),
            radius_step_km: env_parse("HSD_RADIUS_STEP_KM", defaults.radius_step_km),
            max_radius_km: env_parse("HSD_MAX_RADIUS_KM", defaults.max_radius_km),
            retry_delay: Duration::from_secs(env_parse("HSD_RETRY_DELAY_SECS", 5)),
            offer_window: Duration::from_secs(env_parse("HSD_OFFER_WINDOW_SECS", 90)),
            accept_deadline: Duration::from_secs(env_parse("HSD_ACCEPT_DEADLINE_SECS", 120)),
            stale_age: Duration::from_secs(env_parse("HSD_STALE_AGE_SECS", 24 * 3600)),
            sweep_cron: std::env::var("HSD_SWEEP_CRON").unwrap_or(defaults.sweep_cron),
            scheduler_enabled: std::env::var("HSD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            skill_aliases: std::env::var("HSD_SKILL_ALIASES")
                .map(|raw| parse_skill_aliases(&raw))
                .unwrap_or_default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Comma-separated `alias=canonical` pairs, normalized the way skills are.
fn parse_skill_aliases(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(alias, canonical)| (alias.trim().to_lowercase(), canonical.trim().to_lowercase()))
        .filter(|(alias, canonical)| !alias.is_empty() && !canonical.is_empty())
        .collect()
}

/// New booking handed to the engine by the client-facing request path.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub client_id: String,
    pub category_id: String,
    pub category_name: String,
    pub sub_service: String,
    pub location: Location,
    pub schedule_date: Option<String>,
    pub schedule_time: Option<String>,
    pub base_price: f64,
    pub pricing_mode: PricingMode,
    pub origin: BookingOrigin,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Dispatched { radius_km: f64, offers: usize },
    NoWorkersAvailable,
    /// The booking left `searching` while the search was in flight.
    Aborted(BookingStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptOutcome {
    pub won: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The target state already held; no writes, no side effects.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancellationReceipt {
    pub fee: f64,
    pub outcome: TransitionOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub deleted: usize,
    pub errors: Vec<String>,
}

fn status_tag(status: BookingStatus) -> &'static str {
    match status {
        BookingStatus::Searching => "searching",
        BookingStatus::Accepted => "accepted",
        BookingStatus::OnTheWay => "on_the_way",
        BookingStatus::Arrived => "arrived",
        BookingStatus::InProgress => "in_progress",
        BookingStatus::Completed => "completed",
        BookingStatus::Cancelled => "cancelled",
        BookingStatus::NoWorkersAvailable => "no_workers_available",
        BookingStatus::Rejected => "rejected",
    }
}

fn searching_unassigned(doc: &Value) -> bool {
    doc["status"] == "searching" && doc["assigned_worker"].is_null()
}

/// Evidence-missing criterion shared by the integrity check and the revert
/// predicate: absent evidence and a blank artifact reference are the same
/// corruption.
fn completion_evidence_missing(doc: &Value) -> bool {
    match doc["completion_evidence"]["artifact_ref"].as_str() {
        Some(artifact_ref) => artifact_ref.trim().is_empty(),
        None => true,
    }
}

/// The matching/dispatch/lifecycle engine. Cheap to clone; every clone shares
/// the same store handle, so per-booking searches and deadline timers run as
/// independent tasks.
#[derive(Clone)]
pub struct DispatchEngine {
    store: Arc<dyn DocumentStore>,
    config: EngineConfig,
}

impl DispatchEngine {
    pub fn new(store: Arc<dyn DocumentStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn booking(&self, booking_id: &str) -> Result<Booking, EngineError> {
        let doc = self
            .store
            .get(BOOKINGS, booking_id)
            .await
            .map_err(|e| map_lookup("booking", booking_id, e))?;
        serde_json::from_value(doc)
            .map_err(|e| EngineError::DataIntegrity(format!("booking {booking_id}: {e}")))
    }

    pub async fn worker(&self, worker_id: &str) -> Result<WorkerProfile, EngineError> {
        let doc = self
            .store
            .get(WORKERS, worker_id)
            .await
            .map_err(|e| map_lookup("worker", worker_id, e))?;
        serde_json::from_value(doc)
            .map_err(|e| EngineError::DataIntegrity(format!("worker {worker_id}: {e}")))
    }

    pub async fn create_booking(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let now = Utc::now();
        let cleanup_after = ChronoDuration::seconds(self.config.accept_deadline.as_secs() as i64);
        let mut booking = Booking {
            id: String::new(),
            client_id: request.client_id,
            category_id: request.category_id,
            category_name: request.category_name,
            sub_service: request.sub_service,
            location: request.location,
            schedule_date: request.schedule_date,
            schedule_time: request.schedule_time,
            pricing: Pricing::estimate(request.base_price),
            pricing_mode: request.pricing_mode,
            final_pricing: None,
            status: BookingStatus::Searching,
            assigned_worker: None,
            job_timer: None,
            completion_evidence: None,
            created_at: now,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            cancellation_fee: None,
            auto_cleanup_at: Some(now + cleanup_after),
            origin: request.origin,
        };
        let doc = serde_json::to_value(&booking)
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
        booking.id = self.store.create(BOOKINGS, doc).await?;
        Ok(booking)
    }

    /// Register a worker profile; used by the demo path and tests. Production
    /// worker onboarding lives outside this core.
    pub async fn register_worker(
        &self,
        mut profile: WorkerProfile,
    ) -> Result<WorkerProfile, EngineError> {
        let doc = serde_json::to_value(&profile)
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
        profile.id = self.store.create(WORKERS, doc).await?;
        Ok(profile)
    }

    /// Explicit snapshot stream of one booking for presentation collaborators.
    pub async fn watch_booking(&self, booking_id: &str) -> Result<Subscription, EngineError> {
        Ok(self
            .store
            .subscribe(BOOKINGS, vec![Filter::eq("id", booking_id)])
            .await?)
    }

    // ---- matching -------------------------------------------------------

    /// Expanding-radius search. Each retry re-reads the booking so a booking
    /// cancelled mid-search stops dispatching immediately, and the inter-retry
    /// delay suspends only this booking's task.
    pub async fn find_and_dispatch(&self, booking_id: &str) -> Result<SearchOutcome, EngineError> {
        let mut radius_km = self.config.initial_radius_km;
        loop {
            let booking = self.booking(booking_id).await?;
            if booking.status != BookingStatus::Searching {
                info!(booking_id, status = ?booking.status, "search stopped; booking left searching");
                return Ok(SearchOutcome::Aborted(booking.status));
            }

            let candidates = self.candidate_workers(&booking, radius_km).await?;
            if !candidates.is_empty() {
                let offers = self.dispatch(&booking, &candidates).await;
                self.arm_accept_deadline(booking_id);
                info!(booking_id, radius_km, offers, "offers dispatched");
                return Ok(SearchOutcome::Dispatched { radius_km, offers });
            }

            if radius_km >= self.config.max_radius_km {
                let applied = self
                    .store
                    .conditional_update(
                        BOOKINGS,
                        booking_id,
                        &searching_unassigned,
                        json!({"status": "no_workers_available"}),
                    )
                    .await
                    .map_err(|e| map_lookup("booking", booking_id, e))?;
                if applied {
                    info!(booking_id, "search radius exhausted; no workers available");
                    return Ok(SearchOutcome::NoWorkersAvailable);
                }
                let current = self.booking(booking_id).await?.status;
                return Ok(SearchOutcome::Aborted(current));
            }

            tokio::time::sleep(self.config.retry_delay).await;
            radius_km = (radius_km + self.config.radius_step_km).min(self.config.max_radius_km);
        }
    }

    /// Run the search as an independent task so concurrent bookings never
    /// serialize behind one another.
    pub fn spawn_search(
        &self,
        booking_id: String,
    ) -> tokio::task::JoinHandle<Result<SearchOutcome, EngineError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.find_and_dispatch(&booking_id).await })
    }

    async fn candidate_workers(
        &self,
        booking: &Booking,
        radius_km: f64,
    ) -> Result<Vec<WorkerProfile>, EngineError> {
        let docs = self
            .store
            .query(
                WORKERS,
                &[
                    Filter::eq("availability", "online"),
                    Filter::eq("verification_status", "verified"),
                ],
                None,
            )
            .await?;

        let mut candidates = Vec::new();
        for doc in docs {
            let worker: WorkerProfile = match serde_json::from_value(doc) {
                Ok(worker) => worker,
                Err(err) => {
                    warn!(%err, "skipping undecodable worker record");
                    continue;
                }
            };
            if !self.worker_matches_skills(&worker, booking) {
                continue;
            }
            if distance_km(worker.location, booking.location.point()) <= radius_km {
                candidates.push(worker);
            }
        }
        Ok(candidates)
    }

    fn normalize_skill(&self, raw: &str) -> String {
        let token = raw.trim().to_lowercase();
        self.config
            .skill_aliases
            .get(&token)
            .cloned()
            .unwrap_or(token)
    }

    /// Normalized token equality against the booking's category or
    /// sub-service, widened by the configured alias table. Substring
    /// containment is deliberately not used.
    fn worker_matches_skills(&self, worker: &WorkerProfile, booking: &Booking) -> bool {
        let targets = [
            self.normalize_skill(&booking.category_name),
            self.normalize_skill(&booking.sub_service),
        ];
        worker
            .skills
            .iter()
            .any(|skill| targets.contains(&self.normalize_skill(skill)))
    }

    // ---- dispatch -------------------------------------------------------

    /// Fan out one offer per candidate. Offers are created concurrently and
    /// fail independently: one failed create never blocks the rest.
    pub async fn dispatch(&self, booking: &Booking, candidates: &[WorkerProfile]) -> usize {
        let now = Utc::now();
        let expires_at =
            now + ChronoDuration::seconds(self.config.offer_window.as_secs() as i64);

        let creates = candidates.iter().map(|worker| {
            let offer = JobOffer {
                id: String::new(),
                worker_id: worker.id.clone(),
                booking_id: booking.id.clone(),
                created_at: now,
                expires_at,
                read: false,
                priority: "high".to_string(),
                payload: OfferPayload {
                    category_name: booking.category_name.clone(),
                    sub_service: booking.sub_service.clone(),
                    address: booking.location.address.clone(),
                    estimated_earnings: booking.pricing.estimated_worker_earnings(),
                },
            };
            async move {
                let mut doc = serde_json::to_value(&offer)
                    .map_err(|e| StoreError::Transient(e.to_string()))?;
                if let Some(obj) = doc.as_object_mut() {
                    obj.insert("kind".into(), Value::String("job_offer".into()));
                }
                self.store.create(NOTIFICATIONS, doc).await.map(|_| ())
            }
        });

        let mut created = 0;
        for (worker, result) in candidates.iter().zip(join_all(creates).await) {
            match result {
                Ok(()) => created += 1,
                Err(err) => {
                    warn!(worker_id = %worker.id, booking_id = %booking.id, %err, "offer creation failed")
                }
            }
        }
        created
    }

    /// Arm the booking-level acceptance deadline: if the booking is still
    /// `searching` when it fires, it becomes `no_workers_available`.
    fn arm_accept_deadline(&self, booking_id: &str) {
        let engine = self.clone();
        let booking_id = booking_id.to_string();
        let deadline = self.config.accept_deadline;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            match engine
                .store
                .conditional_update(
                    BOOKINGS,
                    &booking_id,
                    &searching_unassigned,
                    json!({"status": "no_workers_available"}),
                )
                .await
            {
                Ok(true) => info!(%booking_id, "acceptance deadline passed; booking expired"),
                Ok(false) => {}
                Err(err) => warn!(%booking_id, %err, "acceptance deadline update failed"),
            }
        });
    }

    // ---- acceptance arbitration -----------------------------------------

    /// True when the worker holds an offer for the booking whose window has
    /// not yet passed. Void offers stay in the store, so expiry is checked
    /// here rather than by presence.
    async fn has_actionable_offer(
        &self,
        booking_id: &str,
        worker_id: &str,
    ) -> Result<bool, EngineError> {
        let docs = self
            .store
            .query(
                NOTIFICATIONS,
                &[
                    Filter::eq("kind", "job_offer"),
                    Filter::eq("booking_id", booking_id),
                    Filter::eq("worker_id", worker_id),
                ],
                None,
            )
            .await?;
        let now = Utc::now();
        for doc in docs {
            let offer: JobOffer = match serde_json::from_value(doc) {
                Ok(offer) => offer,
                Err(err) => {
                    warn!(booking_id, %err, "skipping undecodable offer record");
                    continue;
                }
            };
            if !offer.is_expired(now) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resolve concurrent accept attempts to exactly one winner via an atomic
    /// conditional claim against the store. Only a worker holding an
    /// unexpired offer for the booking may claim it. Losing is a negative
    /// result, not an error; losers must not mutate anything.
    pub async fn accept(
        &self,
        booking_id: &str,
        worker_id: &str,
    ) -> Result<AcceptOutcome, EngineError> {
        if !self.has_actionable_offer(booking_id, worker_id).await? {
            info!(booking_id, worker_id, "claim refused; no actionable offer");
            return Ok(AcceptOutcome { won: false });
        }

        let now = Utc::now();
        let applied = self
            .store
            .conditional_update(
                BOOKINGS,
                booking_id,
                &searching_unassigned,
                json!({
                    "status": "accepted",
                    "assigned_worker": worker_id,
                    "accepted_at": now,
                }),
            )
            .await
            .map_err(|e| map_lookup("booking", booking_id, e))?;

        if !applied {
            return Ok(AcceptOutcome { won: false });
        }

        if let Err(err) = self
            .store
            .conditional_update(
                WORKERS,
                worker_id,
                &|_| true,
                json!({"current_job_id": booking_id, "availability": "busy"}),
            )
            .await
        {
            warn!(worker_id, booking_id, %err, "failed to mark winning worker busy");
        }

        let booking = self.booking(booking_id).await?;
        let notification = json!({
            "kind": "worker_found",
            "client_id": booking.client_id,
            "booking_id": booking_id,
            "worker_id": worker_id,
            "created_at": now,
            "read": false,
        });
        if let Err(err) = self.store.create(NOTIFICATIONS, notification).await {
            warn!(booking_id, %err, "failed to write worker_found notification");
        }

        info!(booking_id, worker_id, "claim won");
        Ok(AcceptOutcome { won: true })
    }

    /// Worker explicitly declines instead of accepting; the booking takes the
    /// terminal `rejected` branch. Declining needs the same unexpired offer
    /// accepting does.
    pub async fn decline(
        &self,
        booking_id: &str,
        worker_id: &str,
    ) -> Result<TransitionOutcome, EngineError> {
        if !self.has_actionable_offer(booking_id, worker_id).await? {
            return Err(EngineError::Forbidden {
                booking_id: booking_id.to_string(),
                actor_id: worker_id.to_string(),
            });
        }
        self.transition(
            booking_id,
            BookingStatus::Searching,
            BookingStatus::Rejected,
            "decline",
            json!({"cancellation_reason": format!("declined by worker {worker_id}")}),
        )
        .await
    }

    // ---- lifecycle ------------------------------------------------------

    pub async fn start_travel(
        &self,
        booking_id: &str,
        worker_id: &str,
    ) -> Result<TransitionOutcome, EngineError> {
        self.assigned_booking(booking_id, worker_id).await?;
        self.transition(
            booking_id,
            BookingStatus::Accepted,
            BookingStatus::OnTheWay,
            "start travel",
            json!({}),
        )
        .await
    }

    pub async fn mark_arrived(
        &self,
        booking_id: &str,
        worker_id: &str,
    ) -> Result<TransitionOutcome, EngineError> {
        self.assigned_booking(booking_id, worker_id).await?;
        self.transition(
            booking_id,
            BookingStatus::OnTheWay,
            BookingStatus::Arrived,
            "mark arrived",
            json!({}),
        )
        .await
    }

    pub async fn start_job(
        &self,
        booking_id: &str,
        worker_id: &str,
    ) -> Result<TransitionOutcome, EngineError> {
        self.assigned_booking(booking_id, worker_id).await?;
        let now = Utc::now();
        self.transition(
            booking_id,
            BookingStatus::Arrived,
            BookingStatus::InProgress,
            "start job",
            json!({
                "started_at": now,
                "job_timer": {"start_time": now, "end_time": null, "duration_secs": null},
            }),
        )
        .await
    }

    /// Close out the job. Requires a proof-of-work payload; a completion
    /// without evidence is never accepted. Records the job timer, computes
    /// final pricing from the elapsed duration, and settles the worker's
    /// stats exactly once.
    pub async fn complete_job(
        &self,
        booking_id: &str,
        worker_id: &str,
        evidence: CompletionEvidence,
    ) -> Result<TransitionOutcome, EngineError> {
        if evidence.artifact_ref.trim().is_empty() {
            return Err(EngineError::DataIntegrity(
                "completion evidence lacks an artifact reference".into(),
            ));
        }

        let booking = self.assigned_booking(booking_id, worker_id).await?;
        let timer = booking.job_timer.ok_or_else(|| {
            EngineError::InvalidTransition {
                from: booking.status,
                action: "complete job",
            }
        })?;

        let now = Utc::now();
        let duration_secs = (now - timer.start_time).num_seconds();
        if evidence.reported_duration_secs > 0
            && (evidence.reported_duration_secs - duration_secs).abs()
                > REPORTED_DURATION_TOLERANCE_SECS
        {
            return Err(EngineError::DataIntegrity(format!(
                "reported duration {}s disagrees with job timer {}s",
                evidence.reported_duration_secs, duration_secs
            )));
        }
        let final_pricing = FinalPricing::calculate(
            booking.pricing.base_price,
            booking.pricing_mode,
            duration_secs,
            &booking.pricing,
        );
        let worker_earnings = final_pricing.worker_earnings;

        let outcome = self
            .transition(
                booking_id,
                BookingStatus::InProgress,
                BookingStatus::Completed,
                "complete job",
                json!({
                    "completed_at": now,
                    "job_timer": {
                        "start_time": timer.start_time,
                        "end_time": now,
                        "duration_secs": duration_secs,
                    },
                    "completion_evidence": evidence,
                    "final_pricing": final_pricing,
                }),
            )
            .await?;

        if outcome == TransitionOutcome::Applied {
            self.settle_worker_after_completion(booking_id, worker_id, worker_earnings)
                .await;
        }
        Ok(outcome)
    }

    /// Clear the worker and credit earnings. Guarded on `current_job_id` so a
    /// replayed completion can never double-settle.
    async fn settle_worker_after_completion(
        &self,
        booking_id: &str,
        worker_id: &str,
        worker_earnings: f64,
    ) {
        let worker = match self.worker(worker_id).await {
            Ok(worker) => worker,
            Err(err) => {
                warn!(worker_id, %err, "cannot settle completion for missing worker");
                return;
            }
        };
        let expected_jobs = Value::from(worker.jobs_completed);
        let patch = json!({
            "current_job_id": null,
            "availability": "online",
            "jobs_completed": worker.jobs_completed + 1,
            "monthly_earnings": worker.monthly_earnings + worker_earnings,
        });
        match self
            .store
            .conditional_update(
                WORKERS,
                worker_id,
                &|doc| doc["current_job_id"] == booking_id && doc["jobs_completed"] == expected_jobs,
                patch,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(worker_id, booking_id, "worker settlement skipped; stale claim"),
            Err(err) => warn!(worker_id, booking_id, %err, "worker settlement failed"),
        }
    }

    /// Client cancellation with the time-based fee schedule. Only legal from
    /// `searching` or `accepted`.
    pub async fn cancel(
        &self,
        booking_id: &str,
        client_id: &str,
        reason: &str,
    ) -> Result<CancellationReceipt, EngineError> {
        let booking = self.booking(booking_id).await?;
        if booking.client_id != client_id {
            return Err(EngineError::Forbidden {
                booking_id: booking_id.to_string(),
                actor_id: client_id.to_string(),
            });
        }

        let now = Utc::now();
        let fee = match booking.status {
            BookingStatus::Searching => {
                if now - booking.created_at <= ChronoDuration::seconds(FREE_CANCEL_WINDOW_SECS) {
                    0.0
                } else {
                    booking.pricing.total * CANCEL_FEE_SEARCHING_RATE
                }
            }
            BookingStatus::Accepted => {
                let remaining = booking.scheduled_at().map(|at| at - now);
                match remaining {
                    Some(left)
                        if left >= ChronoDuration::seconds(LATE_CANCEL_THRESHOLD_SECS) =>
                    {
                        booking.pricing.total * CANCEL_FEE_EARLY_RATE
                    }
                    _ => booking.pricing.total * CANCEL_FEE_LATE_RATE,
                }
            }
            other => {
                return Err(EngineError::InvalidTransition {
                    from: other,
                    action: "cancel",
                })
            }
        };

        let outcome = self
            .transition(
                booking_id,
                booking.status,
                BookingStatus::Cancelled,
                "cancel",
                json!({
                    "cancelled_at": now,
                    "cancellation_reason": reason,
                    "cancellation_fee": fee,
                }),
            )
            .await?;

        if outcome == TransitionOutcome::Applied {
            if let Some(worker_id) = &booking.assigned_worker {
                self.release_worker(worker_id, booking_id).await;
            }
        }
        Ok(CancellationReceipt { fee, outcome })
    }

    async fn release_worker(&self, worker_id: &str, booking_id: &str) {
        match self
            .store
            .conditional_update(
                WORKERS,
                worker_id,
                &|doc| doc["current_job_id"] == booking_id,
                json!({"current_job_id": null, "availability": "online"}),
            )
            .await
        {
            Ok(_) => {}
            Err(err) => warn!(worker_id, booking_id, %err, "failed to release worker"),
        }
    }

    /// Central transition rule: a conditional write pinned on the from-state.
    /// Re-applying a transition whose target already holds reports
    /// `Unchanged` instead of duplicating side effects.
    async fn transition(
        &self,
        booking_id: &str,
        from: BookingStatus,
        to: BookingStatus,
        action: &'static str,
        mut patch: Value,
    ) -> Result<TransitionOutcome, EngineError> {
        let from_tag = status_tag(from);
        match patch.as_object_mut() {
            Some(obj) => {
                obj.insert("status".into(), Value::String(status_tag(to).into()));
            }
            None => {
                return Err(EngineError::DataIntegrity(
                    "transition patch must be a JSON object".into(),
                ))
            }
        }

        let applied = self
            .store
            .conditional_update(BOOKINGS, booking_id, &|doc| doc["status"] == from_tag, patch)
            .await
            .map_err(|e| map_lookup("booking", booking_id, e))?;
        if applied {
            info!(booking_id, from = from_tag, to = status_tag(to), "transition applied");
            return Ok(TransitionOutcome::Applied);
        }

        let current = self.booking(booking_id).await?.status;
        if current == to {
            Ok(TransitionOutcome::Unchanged)
        } else {
            Err(EngineError::InvalidTransition {
                from: current,
                action,
            })
        }
    }

    async fn assigned_booking(
        &self,
        booking_id: &str,
        worker_id: &str,
    ) -> Result<Booking, EngineError> {
        let booking = self.booking(booking_id).await?;
        if booking.assigned_worker.as_deref() != Some(worker_id) {
            return Err(EngineError::Forbidden {
                booking_id: booking_id.to_string(),
                actor_id: worker_id.to_string(),
            });
        }
        Ok(booking)
    }

    // ---- integrity ------------------------------------------------------

    /// A `completed` booking without completion evidence is a corrupted-state
    /// condition, never a valid completion.
    pub async fn verify_completion_integrity(&self, booking_id: &str) -> Result<(), EngineError> {
        let booking = self.booking(booking_id).await?;
        if booking.status != BookingStatus::Completed {
            return Ok(());
        }
        let intact = booking
            .completion_evidence
            .as_ref()
            .map(|e| !e.artifact_ref.trim().is_empty())
            .unwrap_or(false);
        if intact {
            Ok(())
        } else {
            Err(EngineError::DataIntegrity(format!(
                "booking {booking_id} is completed without completion evidence"
            )))
        }
    }

    /// Administrative recovery for a corrupted completion: the only legal way
    /// out is back to `accepted`, with the worker re-engaged.
    pub async fn revert_to_accepted(
        &self,
        booking_id: &str,
    ) -> Result<TransitionOutcome, EngineError> {
        let booking = self.booking(booking_id).await?;
        let applied = self
            .store
            .conditional_update(
                BOOKINGS,
                booking_id,
                &|doc| doc["status"] == "completed" && completion_evidence_missing(doc),
                json!({
                    "status": "accepted",
                    "completed_at": null,
                    "started_at": null,
                    "job_timer": null,
                    "completion_evidence": null,
                    "final_pricing": null,
                }),
            )
            .await
            .map_err(|e| map_lookup("booking", booking_id, e))?;

        if !applied {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                action: "revert to accepted",
            });
        }

        if let Some(worker_id) = &booking.assigned_worker {
            if let Err(err) = self
                .store
                .conditional_update(
                    WORKERS,
                    worker_id,
                    &|_| true,
                    json!({"current_job_id": booking_id, "availability": "busy"}),
                )
                .await
            {
                warn!(%worker_id, booking_id, %err, "failed to re-engage worker on revert");
            }
        }
        Ok(TransitionOutcome::Applied)
    }

    // ---- sweeping -------------------------------------------------------

    /// Reclaim unmatched bookings past their cleanup deadline. Each candidate
    /// is re-verified immediately before deletion so a booking accepted
    /// between the query and the delete survives. Per-document failures are
    /// collected and never abort the batch.
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        let now = Utc::now();
        let candidates = self
            .store
            .query(
                BOOKINGS,
                &[
                    Filter::eq("status", "searching"),
                    Filter::le("auto_cleanup_at", now.to_rfc3339()),
                ],
                None,
            )
            .await?;
        self.delete_unmatched(candidates).await
    }

    /// General-hygiene variant: delete `searching` bookings older than the
    /// age threshold regardless of `auto_cleanup_at`.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<SweepReport, EngineError> {
        let cutoff = Utc::now() - ChronoDuration::seconds(max_age.as_secs() as i64);
        let candidates = self
            .store
            .query(
                BOOKINGS,
                &[
                    Filter::eq("status", "searching"),
                    Filter::le("created_at", cutoff.to_rfc3339()),
                ],
                None,
            )
            .await?;
        self.delete_unmatched(candidates).await
    }

    async fn delete_unmatched(&self, candidates: Vec<Value>) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();
        for doc in candidates {
            let Some(id) = doc["id"].as_str().map(str::to_string) else {
                report.errors.push("candidate without id field".into());
                continue;
            };
            match self.delete_if_still_unmatched(&id).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(err) => report.errors.push(format!("{id}: {err}")),
            }
        }
        if report.deleted > 0 || !report.errors.is_empty() {
            info!(deleted = report.deleted, errors = report.errors.len(), "sweep finished");
        }
        Ok(report)
    }

    async fn delete_if_still_unmatched(&self, booking_id: &str) -> Result<bool, EngineError> {
        // Re-verify right before deletion; acceptance may have landed since
        // the candidate query.
        let doc = match self.store.get(BOOKINGS, booking_id).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if !searching_unassigned(&doc) {
            return Ok(false);
        }
        match self.store.delete(BOOKINGS, booking_id).await {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Out-of-band cron scheduling for the sweeps, when enabled by config.
    pub async fn maybe_build_scheduler(&self) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let engine = self.clone();
        let stale_age = self.config.stale_age;
        let job = Job::new_async(self.config.sweep_cron.as_str(), move |_uuid, _l| {
            let engine = engine.clone();
            Box::pin(async move {
                match engine.sweep().await {
                    Ok(report) => info!(
                        deleted = report.deleted,
                        errors = report.errors.len(),
                        "scheduled expiration sweep finished"
                    ),
                    Err(err) => warn!(%err, "scheduled expiration sweep failed"),
                }
                match engine.sweep_stale(stale_age).await {
                    Ok(report) => info!(deleted = report.deleted, "scheduled stale sweep finished"),
                    Err(err) => warn!(%err, "scheduled stale sweep failed"),
                }
            })
        })
        .with_context(|| format!("creating sweep job for cron {}", self.config.sweep_cron))?;
        sched.add(job).await.context("adding sweep job")?;
        Ok(Some(sched))
    }
}

/// Offers for a booking, decoded from the notification records.
pub async fn offers_for_booking(
    store: &dyn DocumentStore,
    booking_id: &str,
) -> Result<Vec<JobOffer>, EngineError> {
    let docs = store
        .query(
            NOTIFICATIONS,
            &[
                Filter::eq("kind", "job_offer"),
                Filter::eq("booking_id", booking_id),
            ],
            None,
        )
        .await?;
    let mut offers = Vec::with_capacity(docs.len());
    for doc in docs {
        offers.push(
            serde_json::from_value(doc)
                .map_err(|e| EngineError::DataIntegrity(format!("offer decode: {e}")))?,
        );
    }
    Ok(offers)
}
