//! Postgres-backed store over runtime `sqlx` queries.

use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rsd_core::fees::{Promotion, PromotionScope};
use rsd_core::{
    sort_candidates, Candidate, CandidateQuery, FeeSource, FinishReason, GeoPoint, Location,
    Party, PaymentMethod, Provider, ProviderId, RequestId, RequestStatus, ServiceRequest,
    ServiceType,
};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    stored_status_names, DeclineEntry, FeeRecord, LedgerStore, ProviderStore, RequestStore,
    ReviewFlag,
};

const REQUEST_COLUMNS: &str = r#"
    id, client_id, status, service_type,
    origin_lat, origin_lng, origin_address,
    destination_lat, destination_lng, destination_address,
    proposed_value, agreed_value, last_proposal_by, value_accepted,
    provider_id, declined_provider_ids, provider_finish_requested_at,
    payment_method, fulfilled_by, finish_reason, canceled_by, cancel_reason,
    created_at, updated_at
"#;

const PROVIDER_COLUMNS: &str = r#"
    id, lat, lng, radar_range_km, services_offered, online, last_heartbeat_at,
    current_request_id, blocked, custom_fee_enabled, custom_fee_percentage,
    custom_fee_fixed, pending_balance_cents
"#;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown {column} value {value:?}")]
    UnknownValue { column: &'static str, value: String },
}

fn unknown(column: &'static str, value: &str) -> DecodeError {
    DecodeError::UnknownValue {
        column,
        value: value.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn request_from_row(row: &PgRow) -> anyhow::Result<ServiceRequest> {
    let status: String = row.try_get("status")?;
    let service_type: String = row.try_get("service_type")?;
    let last_proposal_by: Option<String> = row.try_get("last_proposal_by")?;
    let payment_method: Option<String> = row.try_get("payment_method")?;
    let finish_reason: Option<String> = row.try_get("finish_reason")?;
    let canceled_by: Option<String> = row.try_get("canceled_by")?;
    let declined: Vec<Uuid> = row.try_get("declined_provider_ids")?;

    let destination_lat: Option<f64> = row.try_get("destination_lat")?;
    let destination_lng: Option<f64> = row.try_get("destination_lng")?;
    let destination_address: Option<String> = row.try_get("destination_address")?;
    let destination = match (destination_lat, destination_lng, destination_address) {
        (Some(lat), Some(lng), Some(address)) => Some(Location { lat, lng, address }),
        _ => None,
    };

    Ok(ServiceRequest {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        status: RequestStatus::parse(&status).ok_or_else(|| unknown("status", &status))?,
        service_type: ServiceType::parse(&service_type)?,
        origin: Location {
            lat: row.try_get("origin_lat")?,
            lng: row.try_get("origin_lng")?,
            address: row.try_get("origin_address")?,
        },
        destination,
        proposed_value: row.try_get("proposed_value")?,
        agreed_value: row.try_get("agreed_value")?,
        last_proposal_by: last_proposal_by
            .map(|v| Party::parse(&v).ok_or_else(|| unknown("last_proposal_by", &v)))
            .transpose()?,
        value_accepted: row.try_get("value_accepted")?,
        provider_id: row.try_get("provider_id")?,
        declined_provider_ids: declined.into_iter().collect(),
        provider_finish_requested_at: row.try_get("provider_finish_requested_at")?,
        payment_method: payment_method
            .map(|v| PaymentMethod::parse(&v).ok_or_else(|| unknown("payment_method", &v)))
            .transpose()?,
        fulfilled_by: row.try_get("fulfilled_by")?,
        finish_reason: finish_reason
            .map(|v| FinishReason::parse(&v).ok_or_else(|| unknown("finish_reason", &v)))
            .transpose()?,
        canceled_by: canceled_by
            .map(|v| Party::parse(&v).ok_or_else(|| unknown("canceled_by", &v)))
            .transpose()?,
        cancel_reason: row.try_get("cancel_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn provider_from_row(row: &PgRow) -> anyhow::Result<Provider> {
    let services: Vec<String> = row.try_get("services_offered")?;
    let services_offered = services
        .iter()
        .map(|s| ServiceType::parse(s))
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(Provider {
        id: row.try_get("id")?,
        location: GeoPoint::new(row.try_get("lat")?, row.try_get("lng")?),
        radar_range_km: row.try_get("radar_range_km")?,
        services_offered,
        online: row.try_get("online")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        current_request_id: row.try_get("current_request_id")?,
        blocked: row.try_get("blocked")?,
        custom_fee_enabled: row.try_get("custom_fee_enabled")?,
        custom_fee_percentage: row.try_get("custom_fee_percentage")?,
        custom_fee_fixed: row.try_get("custom_fee_fixed")?,
        pending_balance_cents: row.try_get("pending_balance_cents")?,
    })
}

fn fee_record_from_row(row: &PgRow) -> anyhow::Result<FeeRecord> {
    let source: String = row.try_get("source")?;
    let payment_method: Option<String> = row.try_get("payment_method")?;
    Ok(FeeRecord {
        request_id: row.try_get("request_id")?,
        provider_id: row.try_get("provider_id")?,
        total_cents: row.try_get("total_cents")?,
        percentage: row.try_get("percentage")?,
        percentage_fee_cents: row.try_get("percentage_fee_cents")?,
        fixed_fee_cents: row.try_get("fixed_fee_cents")?,
        application_fee_cents: row.try_get("application_fee_cents")?,
        provider_net_cents: row.try_get("provider_net_cents")?,
        source: FeeSource::parse(&source).ok_or_else(|| unknown("source", &source))?,
        promotion_id: row.try_get("promotion_id")?,
        payment_method: payment_method
            .map(|v| PaymentMethod::parse(&v).ok_or_else(|| unknown("payment_method", &v)))
            .transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl RequestStore for PgStore {
    async fn insert_request(&self, request: &ServiceRequest) -> anyhow::Result<()> {
        let declined = request.declined_provider_ids.iter().copied().collect::<Vec<_>>();
        sqlx::query(
            r#"
            INSERT INTO requests (
                id, client_id, status, service_type,
                origin_lat, origin_lng, origin_address,
                destination_lat, destination_lng, destination_address,
                proposed_value, agreed_value, last_proposal_by, value_accepted,
                provider_id, declined_provider_ids, provider_finish_requested_at,
                payment_method, fulfilled_by, finish_reason, canceled_by, cancel_reason,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24
            )
            "#,
        )
        .bind(request.id)
        .bind(request.client_id)
        .bind(request.status.as_str())
        .bind(request.service_type.as_str())
        .bind(request.origin.lat)
        .bind(request.origin.lng)
        .bind(&request.origin.address)
        .bind(request.destination.as_ref().map(|d| d.lat))
        .bind(request.destination.as_ref().map(|d| d.lng))
        .bind(request.destination.as_ref().map(|d| d.address.clone()))
        .bind(request.proposed_value)
        .bind(request.agreed_value)
        .bind(request.last_proposal_by.map(Party::as_str))
        .bind(request.value_accepted)
        .bind(request.provider_id)
        .bind(&declined)
        .bind(request.provider_finish_requested_at)
        .bind(request.payment_method.map(PaymentMethod::as_str))
        .bind(request.fulfilled_by)
        .bind(request.finish_reason.map(FinishReason::as_str))
        .bind(request.canceled_by.map(Party::as_str))
        .bind(&request.cancel_reason)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting request {}", request.id))?;
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> anyhow::Result<Option<ServiceRequest>> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading request {id}"))?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn try_assign(
        &self,
        id: RequestId,
        provider_id: ProviderId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ServiceRequest>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE requests
               SET status = 'negotiating',
                   provider_id = $2,
                   proposed_value = NULL,
                   agreed_value = NULL,
                   last_proposal_by = NULL,
                   value_accepted = FALSE,
                   updated_at = $3
             WHERE id = $1
               AND status = 'searching'
               AND provider_id IS NULL
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(provider_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("assigning request {id}"))?;
        if row.is_none() {
            debug!(request_id = %id, provider_id = %provider_id, "conditional assignment matched no row");
        }
        row.as_ref().map(request_from_row).transpose()
    }

    async fn update_if_status(
        &self,
        request: &ServiceRequest,
        expected: RequestStatus,
    ) -> anyhow::Result<bool> {
        let declined = request.declined_provider_ids.iter().copied().collect::<Vec<_>>();
        let expected_names = stored_status_names(expected)
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        let result = sqlx::query(
            r#"
            UPDATE requests
               SET status = $2,
                   proposed_value = $3,
                   agreed_value = $4,
                   last_proposal_by = $5,
                   value_accepted = $6,
                   provider_id = $7,
                   declined_provider_ids = ARRAY(
                       SELECT DISTINCT unnest(declined_provider_ids || $8::uuid[])
                   ),
                   provider_finish_requested_at = $9,
                   payment_method = $10,
                   fulfilled_by = $11,
                   finish_reason = $12,
                   canceled_by = $13,
                   cancel_reason = $14,
                   updated_at = $15
             WHERE id = $1
               AND status = ANY($16)
            "#,
        )
        .bind(request.id)
        .bind(request.status.as_str())
        .bind(request.proposed_value)
        .bind(request.agreed_value)
        .bind(request.last_proposal_by.map(Party::as_str))
        .bind(request.value_accepted)
        .bind(request.provider_id)
        .bind(&declined)
        .bind(request.provider_finish_requested_at)
        .bind(request.payment_method.map(PaymentMethod::as_str))
        .bind(request.fulfilled_by)
        .bind(request.finish_reason.map(FinishReason::as_str))
        .bind(request.canceled_by.map(Party::as_str))
        .bind(&request.cancel_reason)
        .bind(request.updated_at)
        .bind(&expected_names)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating request {}", request.id))?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_decline(&self, entry: &DeclineEntry) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("opening decline transaction")?;
        sqlx::query(
            r#"
            INSERT INTO declines (request_id, provider_id, declined_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(entry.request_id)
        .bind(entry.provider_id)
        .bind(entry.declined_at)
        .execute(&mut *tx)
        .await
        .context("appending decline")?;
        sqlx::query(
            r#"
            UPDATE requests
               SET declined_provider_ids = array_append(declined_provider_ids, $2)
             WHERE id = $1
               AND NOT ($2 = ANY(declined_provider_ids))
            "#,
        )
        .bind(entry.request_id)
        .bind(entry.provider_id)
        .execute(&mut *tx)
        .await
        .context("merging decline into request")?;
        tx.commit().await.context("committing decline")?;
        Ok(())
    }

    async fn list_pending_confirmation_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ServiceRequest>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
              FROM requests
             WHERE status = 'pending_client_confirmation'
               AND provider_finish_requested_at <= $1
             ORDER BY provider_finish_requested_at
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("listing expired pending confirmations")?;
        rows.iter().map(request_from_row).collect()
    }
}

#[async_trait]
impl ProviderStore for PgStore {
    async fn upsert_provider(&self, provider: &Provider) -> anyhow::Result<()> {
        let services = provider
            .services_offered
            .iter()
            .map(|s| s.as_str().to_string())
            .collect::<Vec<_>>();
        sqlx::query(
            r#"
            INSERT INTO providers (
                id, lat, lng, radar_range_km, services_offered, online, last_heartbeat_at,
                current_request_id, blocked, custom_fee_enabled, custom_fee_percentage,
                custom_fee_fixed, pending_balance_cents, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            ON CONFLICT (id) DO UPDATE SET
                lat = EXCLUDED.lat,
                lng = EXCLUDED.lng,
                radar_range_km = EXCLUDED.radar_range_km,
                services_offered = EXCLUDED.services_offered,
                online = EXCLUDED.online,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                current_request_id = EXCLUDED.current_request_id,
                blocked = EXCLUDED.blocked,
                custom_fee_enabled = EXCLUDED.custom_fee_enabled,
                custom_fee_percentage = EXCLUDED.custom_fee_percentage,
                custom_fee_fixed = EXCLUDED.custom_fee_fixed,
                updated_at = NOW()
            "#,
        )
        .bind(provider.id)
        .bind(provider.location.lat)
        .bind(provider.location.lng)
        .bind(provider.radar_range_km)
        .bind(&services)
        .bind(provider.online)
        .bind(provider.last_heartbeat_at)
        .bind(provider.current_request_id)
        .bind(provider.blocked)
        .bind(provider.custom_fee_enabled)
        .bind(provider.custom_fee_percentage)
        .bind(provider.custom_fee_fixed)
        .bind(provider.pending_balance_cents)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting provider {}", provider.id))?;
        Ok(())
    }

    async fn get_provider(&self, id: ProviderId) -> anyhow::Result<Option<Provider>> {
        let row = sqlx::query(&format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading provider {id}"))?;
        row.as_ref().map(provider_from_row).transpose()
    }

    async fn find_candidates(&self, query: &CandidateQuery) -> anyhow::Result<Vec<Candidate>> {
        let bbox = query.bounding_box();
        let wraps = bbox.min_lng < -180.0 || bbox.max_lng > 180.0;
        let exclude = query.exclude.iter().copied().collect::<Vec<_>>();
        let heartbeat_cutoff = query.now - query.heartbeat_freshness;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PROVIDER_COLUMNS}
              FROM providers
             WHERE online
               AND NOT blocked
               AND current_request_id IS NULL
               AND $1 = ANY(services_offered)
               AND last_heartbeat_at >= $2
               AND lat BETWEEN $3 AND $4
               AND ($5 OR lng BETWEEN $6 AND $7)
               AND NOT (id = ANY($8))
            "#
        ))
        .bind(query.service_type.as_str())
        .bind(heartbeat_cutoff)
        .bind(bbox.min_lat)
        .bind(bbox.max_lat)
        .bind(wraps)
        .bind(bbox.min_lng)
        .bind(bbox.max_lng)
        .bind(&exclude)
        .fetch_all(&self.pool)
        .await
        .context("querying candidate providers")?;

        // The envelope is only a prefilter; the exact filter runs here.
        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            let provider = provider_from_row(row)?;
            if bbox.contains(provider.location) {
                if let Some(candidate) = query.evaluate(&provider) {
                    found.push(candidate);
                }
            }
        }
        sort_candidates(&mut found);
        Ok(found)
    }

    async fn set_current_request(
        &self,
        provider_id: ProviderId,
        request_id: Option<RequestId>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE providers
               SET current_request_id = $2,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(provider_id)
        .bind(request_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating engagement of provider {provider_id}"))?;
        Ok(())
    }

    async fn claim_provider(
        &self,
        provider_id: ProviderId,
        request_id: RequestId,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE providers
               SET current_request_id = $2,
                   updated_at = NOW()
             WHERE id = $1
               AND NOT blocked
               AND current_request_id IS NULL
            "#,
        )
        .bind(provider_id)
        .bind(request_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("claiming provider {provider_id} for {request_id}"))?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn global_fee_percentage(&self) -> anyhow::Result<Option<f64>> {
        let row = sqlx::query("SELECT global_percentage FROM fee_settings WHERE id")
            .fetch_optional(&self.pool)
            .await
            .context("loading global fee percentage")?;
        match row {
            Some(row) => Ok(Some(row.try_get::<f64, _>("global_percentage")?)),
            None => Ok(None),
        }
    }

    async fn set_global_fee_percentage(&self, percentage: f64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fee_settings (id, global_percentage, updated_at)
            VALUES (TRUE, $1, NOW())
            ON CONFLICT (id) DO UPDATE SET
                global_percentage = EXCLUDED.global_percentage,
                updated_at = NOW()
            "#,
        )
        .bind(percentage)
        .execute(&self.pool)
        .await
        .context("storing global fee percentage")?;
        Ok(())
    }

    async fn active_promotions(&self, at: DateTime<Utc>) -> anyhow::Result<Vec<Promotion>> {
        let rows = sqlx::query(
            r#"
            SELECT id, provider_id, percentage, starts_at, ends_at
              FROM fee_promotions
             WHERE starts_at <= $1
               AND ends_at > $1
            "#,
        )
        .bind(at)
        .fetch_all(&self.pool)
        .await
        .context("loading active promotions")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let provider_id: Option<Uuid> = row.try_get("provider_id")?;
            out.push(Promotion {
                id: row.try_get("id")?,
                scope: match provider_id {
                    Some(provider_id) => PromotionScope::Provider { provider_id },
                    None => PromotionScope::Global,
                },
                percentage: row.try_get("percentage")?,
                starts_at: row.try_get("starts_at")?,
                ends_at: row.try_get("ends_at")?,
            });
        }
        Ok(out)
    }

    async fn insert_promotion(&self, promotion: &Promotion) -> anyhow::Result<()> {
        let provider_id = match promotion.scope {
            PromotionScope::Global => None,
            PromotionScope::Provider { provider_id } => Some(provider_id),
        };
        sqlx::query(
            r#"
            INSERT INTO fee_promotions (id, provider_id, percentage, starts_at, ends_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(promotion.id)
        .bind(provider_id)
        .bind(promotion.percentage)
        .bind(promotion.starts_at)
        .bind(promotion.ends_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting promotion {}", promotion.id))?;
        Ok(())
    }

    async fn fee_record(&self, request_id: RequestId) -> anyhow::Result<Option<FeeRecord>> {
        let row = sqlx::query(
            r#"
            SELECT request_id, provider_id, total_cents, percentage, percentage_fee_cents,
                   fixed_fee_cents, application_fee_cents, provider_net_cents, source,
                   promotion_id, payment_method, created_at
              FROM fee_records
             WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading fee record for {request_id}"))?;
        row.as_ref().map(fee_record_from_row).transpose()
    }

    async fn record_settlement(
        &self,
        record: &FeeRecord,
        pending_balance_delta_cents: i64,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await.context("opening settlement transaction")?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO fee_records (
                request_id, provider_id, total_cents, percentage, percentage_fee_cents,
                fixed_fee_cents, application_fee_cents, provider_net_cents, source,
                promotion_id, payment_method, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(record.request_id)
        .bind(record.provider_id)
        .bind(record.total_cents)
        .bind(record.percentage)
        .bind(record.percentage_fee_cents)
        .bind(record.fixed_fee_cents)
        .bind(record.application_fee_cents)
        .bind(record.provider_net_cents)
        .bind(record.source.as_str())
        .bind(record.promotion_id)
        .bind(record.payment_method.map(PaymentMethod::as_str))
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting fee record for {}", record.request_id))?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await.context("rolling back duplicate settlement")?;
            return Ok(false);
        }

        if pending_balance_delta_cents != 0 {
            sqlx::query(
                r#"
                UPDATE providers
                   SET pending_balance_cents = pending_balance_cents + $2,
                       updated_at = NOW()
                 WHERE id = $1
                "#,
            )
            .bind(record.provider_id)
            .bind(pending_balance_delta_cents)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("updating pending balance of {}", record.provider_id))?;
        }

        tx.commit().await.context("committing settlement")?;
        Ok(true)
    }

    async fn flag_for_review(&self, flag: &ReviewFlag) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO review_flags (request_id, reason, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(flag.request_id)
        .bind(&flag.reason)
        .bind(flag.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("flagging request {} for review", flag.request_id))?;
        Ok(())
    }

    async fn review_flags(&self, request_id: RequestId) -> anyhow::Result<Vec<ReviewFlag>> {
        let rows = sqlx::query(
            r#"
            SELECT request_id, reason, created_at
              FROM review_flags
             WHERE request_id = $1
             ORDER BY created_at
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading review flags for {request_id}"))?;
        rows.iter()
            .map(|row| -> anyhow::Result<ReviewFlag> {
                Ok(ReviewFlag {
                    request_id: row.try_get("request_id")?,
                    reason: row.try_get("reason")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
