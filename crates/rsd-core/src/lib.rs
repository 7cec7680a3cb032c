//! Core domain model for roadside service dispatch.

pub mod fees;
pub mod geo;
pub mod lifecycle;

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use fees::{effective_fee, EffectiveFee, FeeError, FeeSchedule, FeeSource, FeeSplit};
pub use geo::{distance_km, within_radius, BoundingBox, GeoPoint};
pub use lifecycle::{is_valid_transition, LifecycleError, RequestStatus};

pub const CRATE_NAME: &str = "rsd-core";

pub type RequestId = Uuid;
pub type ProviderId = Uuid;
pub type ClientId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Tow,
    BatteryJump,
    TireChange,
    FuelDelivery,
    Lockout,
    Mechanic,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tow => "tow",
            Self::BatteryJump => "battery_jump",
            Self::TireChange => "tire_change",
            Self::FuelDelivery => "fuel_delivery",
            Self::Lockout => "lockout",
            Self::Mechanic => "mechanic",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let service = match raw.trim() {
            "tow" => Self::Tow,
            "battery_jump" => Self::BatteryJump,
            "tire_change" => Self::TireChange,
            "fuel_delivery" => Self::FuelDelivery,
            "lockout" => Self::Lockout,
            "mechanic" => Self::Mechanic,
            other => return Err(ValidationError::UnknownServiceType(other.to_string())),
        };
        Ok(service)
    }

    /// Towing carries the vehicle somewhere; every other service happens on site.
    pub fn requires_destination(self) -> bool {
        matches!(self, Self::Tow)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Client,
    Provider,
}

impl Party {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Provider => "provider",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "client" => Some(Self::Client),
            "provider" => Some(Self::Provider),
            _ => None,
        }
    }
}

/// How the client paid. Gateway payments split the application fee at the
/// gateway; direct payments leave it owed on the provider's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Gateway,
    Direct,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::Direct => "direct",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "gateway" => Some(Self::Gateway),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    ClientConfirmed,
    ClientTimeout,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientConfirmed => "client_confirmed",
            Self::ClientTimeout => "client_timeout",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "client_confirmed" => Some(Self::ClientConfirmed),
            "client_timeout" => Some(Self::ClientTimeout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} coordinates are malformed or out of range")]
    InvalidCoordinates { field: &'static str },
    #[error("unknown service type {0:?}")]
    UnknownServiceType(String),
    #[error("service type {0} requires a destination")]
    MissingDestination(ServiceType),
    #[error("{field} address must not be empty")]
    EmptyAddress { field: &'static str },
}

impl ValidationError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidCoordinates { .. } => "invalid_coordinates",
            Self::UnknownServiceType(_) => "unknown_service_type",
            Self::MissingDestination(_) => "missing_destination",
            Self::EmptyAddress { .. } => "empty_address",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub address: String,
}

impl Location {
    pub fn new(lat: f64, lng: f64, address: impl Into<String>) -> Self {
        Self {
            lat,
            lng,
            address: address.into(),
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }

    fn validate(&self, field: &'static str) -> Result<(), ValidationError> {
        self.point().validate(field)?;
        if self.address.trim().is_empty() {
            return Err(ValidationError::EmptyAddress { field });
        }
        Ok(())
    }
}

/// Submission payload before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewServiceRequest {
    pub client_id: ClientId,
    pub service_type: String,
    pub origin: Location,
    #[serde(default)]
    pub destination: Option<Location>,
}

impl NewServiceRequest {
    /// Validates the submission and builds an `idle` request.
    pub fn into_request(self, now: DateTime<Utc>) -> Result<ServiceRequest, ValidationError> {
        let service_type = ServiceType::parse(&self.service_type)?;
        self.origin.validate("origin")?;
        let destination = match (service_type.requires_destination(), self.destination) {
            (true, None) => return Err(ValidationError::MissingDestination(service_type)),
            (true, Some(dest)) => {
                dest.validate("destination")?;
                Some(dest)
            }
            (false, _) => None,
        };

        Ok(ServiceRequest {
            id: Uuid::new_v4(),
            client_id: self.client_id,
            status: RequestStatus::Idle,
            service_type,
            origin: self.origin,
            destination,
            proposed_value: None,
            agreed_value: None,
            last_proposal_by: None,
            value_accepted: false,
            provider_id: None,
            declined_provider_ids: BTreeSet::new(),
            provider_finish_requested_at: None,
            payment_method: None,
            fulfilled_by: None,
            finish_reason: None,
            canceled_by: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: RequestId,
    pub client_id: ClientId,
    pub status: RequestStatus,
    pub service_type: ServiceType,
    pub origin: Location,
    pub destination: Option<Location>,
    pub proposed_value: Option<f64>,
    pub agreed_value: Option<f64>,
    pub last_proposal_by: Option<Party>,
    pub value_accepted: bool,
    pub provider_id: Option<ProviderId>,
    pub declined_provider_ids: BTreeSet<ProviderId>,
    pub provider_finish_requested_at: Option<DateTime<Utc>>,
    pub payment_method: Option<PaymentMethod>,
    pub fulfilled_by: Option<ProviderId>,
    pub finish_reason: Option<FinishReason>,
    pub canceled_by: Option<Party>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub location: GeoPoint,
    pub radar_range_km: f64,
    pub services_offered: BTreeSet<ServiceType>,
    pub online: bool,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_request_id: Option<RequestId>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub custom_fee_enabled: bool,
    #[serde(default)]
    pub custom_fee_percentage: Option<f64>,
    #[serde(default)]
    pub custom_fee_fixed: Option<f64>,
    #[serde(default)]
    pub pending_balance_cents: i64,
}

impl Provider {
    pub fn custom_rate(&self) -> Option<fees::CustomRate> {
        self.custom_fee_percentage.map(|percentage| fees::CustomRate {
            enabled: self.custom_fee_enabled,
            percentage,
            fixed_fee: self.custom_fee_fixed,
        })
    }

    pub fn heartbeat_is_fresh(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        self.last_heartbeat_at
            .map(|at| now.signed_duration_since(at) <= freshness)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub provider_id: ProviderId,
    pub location: GeoPoint,
    pub distance_km: f64,
}

/// Candidate discovery parameters. [`CandidateQuery::evaluate`] is the single
/// eligibility filter shared by stores and change-feed maintenance.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub origin: GeoPoint,
    pub radius_km: f64,
    pub service_type: ServiceType,
    pub exclude: HashSet<ProviderId>,
    pub now: DateTime<Utc>,
    pub heartbeat_freshness: Duration,
}

impl CandidateQuery {
    pub fn evaluate(&self, provider: &Provider) -> Option<Candidate> {
        if !provider.online
            || provider.blocked
            || provider.current_request_id.is_some()
            || self.exclude.contains(&provider.id)
            || !provider.services_offered.contains(&self.service_type)
            || !provider.heartbeat_is_fresh(self.now, self.heartbeat_freshness)
        {
            return None;
        }
        let distance_km = distance_km(provider.location, self.origin);
        if distance_km > self.radius_km || distance_km > provider.radar_range_km {
            return None;
        }
        Some(Candidate {
            provider_id: provider.id,
            location: provider.location,
            distance_km,
        })
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::around(self.origin, self.radius_km)
    }
}

/// Sorts candidates nearest first, breaking ties by id so results are stable.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.provider_id.cmp(&b.provider_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_at(lat: f64, lng: f64) -> Provider {
        Provider {
            id: Uuid::new_v4(),
            location: GeoPoint::new(lat, lng),
            radar_range_km: 50.0,
            services_offered: [ServiceType::BatteryJump, ServiceType::Tow].into_iter().collect(),
            online: true,
            last_heartbeat_at: Some(Utc::now()),
            current_request_id: None,
            blocked: false,
            custom_fee_enabled: false,
            custom_fee_percentage: None,
            custom_fee_fixed: None,
            pending_balance_cents: 0,
        }
    }

    fn query(radius_km: f64) -> CandidateQuery {
        CandidateQuery {
            origin: GeoPoint::new(-23.55, -46.63),
            radius_km,
            service_type: ServiceType::BatteryJump,
            exclude: HashSet::new(),
            now: Utc::now(),
            heartbeat_freshness: Duration::seconds(120),
        }
    }

    #[test]
    fn tow_requires_destination() {
        let err = NewServiceRequest {
            client_id: Uuid::new_v4(),
            service_type: "tow".into(),
            origin: Location::new(-23.55, -46.63, "Rua Augusta"),
            destination: None,
        }
        .into_request(Utc::now())
        .unwrap_err();
        assert_eq!(err, ValidationError::MissingDestination(ServiceType::Tow));
        assert_eq!(err.reason(), "missing_destination");
    }

    #[test]
    fn on_site_services_drop_destination() {
        let request = NewServiceRequest {
            client_id: Uuid::new_v4(),
            service_type: "lockout".into(),
            origin: Location::new(-23.55, -46.63, "Rua Augusta"),
            destination: Some(Location::new(-23.56, -46.64, "ignored")),
        }
        .into_request(Utc::now())
        .unwrap();
        assert_eq!(request.status, RequestStatus::Idle);
        assert!(request.destination.is_none());
    }

    #[test]
    fn unknown_service_and_bad_coordinates_are_rejected() {
        let base = NewServiceRequest {
            client_id: Uuid::new_v4(),
            service_type: "helicopter".into(),
            origin: Location::new(-23.55, -46.63, "Rua Augusta"),
            destination: None,
        };
        assert_eq!(
            base.clone().into_request(Utc::now()).unwrap_err().reason(),
            "unknown_service_type"
        );
        let bad = NewServiceRequest {
            service_type: "mechanic".into(),
            origin: Location::new(123.0, -46.63, "Rua Augusta"),
            ..base
        };
        assert_eq!(bad.into_request(Utc::now()).unwrap_err().reason(), "invalid_coordinates");
    }

    #[test]
    fn eligibility_filter_applies_every_rule() {
        let q = query(5.0);
        let near = provider_at(-23.56, -46.63);
        assert!(q.evaluate(&near).is_some());

        let mut offline = near.clone();
        offline.online = false;
        assert!(q.evaluate(&offline).is_none());

        let mut stale = near.clone();
        stale.last_heartbeat_at = Some(Utc::now() - Duration::minutes(10));
        assert!(q.evaluate(&stale).is_none());

        let mut busy = near.clone();
        busy.current_request_id = Some(Uuid::new_v4());
        assert!(q.evaluate(&busy).is_none());

        let mut blocked = near.clone();
        blocked.blocked = true;
        assert!(q.evaluate(&blocked).is_none());

        let mut wrong_service = near.clone();
        wrong_service.services_offered = [ServiceType::Lockout].into_iter().collect();
        assert!(q.evaluate(&wrong_service).is_none());

        let mut short_radar = near.clone();
        short_radar.radar_range_km = 0.5;
        assert!(q.evaluate(&short_radar).is_none());

        let mut excluded = q.clone();
        excluded.exclude.insert(near.id);
        assert!(excluded.evaluate(&near).is_none());

        let far = provider_at(-23.60, -46.63);
        assert!(q.evaluate(&far).is_none());
        assert!(query(10.0).evaluate(&far).is_some());
    }

    #[test]
    fn candidates_sort_nearest_first() {
        let q = query(20.0);
        let mut found: Vec<_> = [provider_at(-23.60, -46.63), provider_at(-23.551, -46.63)]
            .iter()
            .filter_map(|p| q.evaluate(p))
            .collect();
        sort_candidates(&mut found);
        assert!(found[0].distance_km < found[1].distance_km);
    }
}
