//! Core domain model, geospatial math, and pricing rules for HSD.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "hsd-core";

/// Mean Earth radius used by the Haversine distance.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Platform margin applied on top of the base price.
pub const SERVICE_CHARGE_RATE: f64 = 0.10;

/// Flat transport fee in currency units, paid through to the worker.
pub const TRANSPORT_FEE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub address: String,
}

impl Location {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

/// Great-circle distance between two coordinates in kilometres.
///
/// Symmetric and side-effect free. NaN inputs are rejected upstream by the
/// request path; here they simply propagate.
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Searching,
    Accepted,
    OnTheWay,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
    NoWorkersAvailable,
    Rejected,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::NoWorkersAvailable | Self::Rejected
        )
    }

    /// States at or past acceptance, where `assigned_worker` must be set.
    pub fn is_assigned_phase(self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::OnTheWay | Self::Arrived | Self::InProgress | Self::Completed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingOrigin {
    Instant,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Online,
    Offline,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    Fixed,
    Hourly,
    Daily,
}

/// Upfront estimate agreed at booking time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub base_price: f64,
    pub service_charge: f64,
    pub transport_fee: f64,
    pub total: f64,
}

impl Pricing {
    pub fn estimate(base_price: f64) -> Self {
        let service_charge = base_price * SERVICE_CHARGE_RATE;
        Self {
            base_price,
            service_charge,
            transport_fee: TRANSPORT_FEE,
            total: base_price + service_charge + TRANSPORT_FEE,
        }
    }

    /// Earnings shown to workers in the offer payload.
    pub fn estimated_worker_earnings(&self) -> f64 {
        self.base_price - self.service_charge + self.transport_fee
    }
}

/// Final invoice computed from elapsed job duration on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalPricing {
    pub base_price: f64,
    pub service_charge: f64,
    pub transport_fee: f64,
    pub total: f64,
    pub worker_earnings: f64,
    pub pricing_mode: PricingMode,
    pub duration_secs: i64,
    pub original_base_price: f64,
}

/// Round up to the nearest half unit (hours or days).
fn round_up_half(value: f64) -> f64 {
    (value * 2.0).ceil() / 2.0
}

impl FinalPricing {
    /// Compute the final charges for a completed job.
    ///
    /// Fail-soft: a non-positive duration or base price unit keeps the
    /// previously agreed estimate rather than producing a bogus figure.
    pub fn calculate(
        base_price_unit: f64,
        mode: PricingMode,
        duration_secs: i64,
        estimate: &Pricing,
    ) -> Self {
        if duration_secs <= 0 || base_price_unit <= 0.0 {
            return Self::from_estimate(estimate, mode, duration_secs);
        }

        let base_price = match mode {
            PricingMode::Fixed => base_price_unit,
            PricingMode::Hourly => {
                let hours = round_up_half((duration_secs as f64 / 3600.0).max(1.0));
                base_price_unit * hours
            }
            PricingMode::Daily => {
                let days = round_up_half((duration_secs as f64 / 3600.0 / 8.0).max(0.5));
                base_price_unit * days
            }
        };

        let service_charge = base_price * SERVICE_CHARGE_RATE;
        Self {
            base_price,
            service_charge,
            transport_fee: TRANSPORT_FEE,
            total: base_price + service_charge + TRANSPORT_FEE,
            worker_earnings: base_price + TRANSPORT_FEE,
            pricing_mode: mode,
            duration_secs,
            original_base_price: base_price_unit,
        }
    }

    fn from_estimate(estimate: &Pricing, mode: PricingMode, duration_secs: i64) -> Self {
        Self {
            base_price: estimate.base_price,
            service_charge: estimate.service_charge,
            transport_fee: estimate.transport_fee,
            total: estimate.total,
            worker_earnings: estimate.base_price + estimate.transport_fee,
            pricing_mode: mode,
            duration_secs,
            original_base_price: estimate.base_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobTimer {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

/// Proof-of-work payload required to close out a job.
///
/// The artifact reference is opaque to the engine; capture and compression
/// belong to an external collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvidence {
    pub artifact_ref: String,
    pub reported_duration_secs: i64,
}

/// A client's service request and its full execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    #[serde(default)]
    pub id: String,
    pub client_id: String,
    pub category_id: String,
    pub category_name: String,
    pub sub_service: String,
    pub location: Location,
    pub schedule_date: Option<String>,
    pub schedule_time: Option<String>,
    pub pricing: Pricing,
    pub pricing_mode: PricingMode,
    pub final_pricing: Option<FinalPricing>,
    pub status: BookingStatus,
    pub assigned_worker: Option<String>,
    pub job_timer: Option<JobTimer>,
    pub completion_evidence: Option<CompletionEvidence>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub cancellation_fee: Option<f64>,
    pub auto_cleanup_at: Option<DateTime<Utc>>,
    pub origin: BookingOrigin,
}

impl Booking {
    /// Scheduled start parsed from the request's date and time strings, when
    /// both are present and well-formed.
    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(self.schedule_date.as_deref()?, "%Y-%m-%d").ok()?;
        let time = NaiveTime::parse_from_str(self.schedule_time.as_deref()?, "%H:%M").ok()?;
        Some(date.and_time(time).and_utc())
    }
}

/// A service provider's dispatch-relevant state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    #[serde(default)]
    pub id: String,
    pub skills: Vec<String>,
    pub availability: Availability,
    pub verification_status: VerificationStatus,
    pub location: GeoPoint,
    pub rating: f64,
    pub current_job_id: Option<String>,
    pub jobs_completed: u32,
    pub monthly_earnings: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub category_name: String,
    pub sub_service: String,
    pub address: String,
    pub estimated_earnings: f64,
}

/// An ephemeral, per-worker invitation to accept a specific booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOffer {
    #[serde(default)]
    pub id: String,
    pub worker_id: String,
    pub booking_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub read: bool,
    pub priority: String,
    pub payload: OfferPayload,
}

impl JobOffer {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Void the instant the booking leaves `searching` or the window passes,
    /// whichever happens first. Void offers stay in the store but must never
    /// be actable.
    pub fn is_actionable(&self, booking_status: BookingStatus, now: DateTime<Utc>) -> bool {
        booking_status == BookingStatus::Searching && !self.is_expired(now)
    }
}
