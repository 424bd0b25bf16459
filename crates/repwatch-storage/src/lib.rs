//! Persisted provider/plan store, the upsert reconciler, and the HTTP
//! source fetcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repwatch_core::{providers, PlanRecord, PlanType, ServiceType};
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "repwatch-storage";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub website: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub id: i64,
    pub provider_id: i64,
    pub plan_name: String,
    pub plan_type: PlanType,
    pub service_type: ServiceType,
    pub zip_code: Option<String>,
    pub contract_months: Option<i32>,
    pub rate_500_cents: Option<f64>,
    pub rate_1000_cents: Option<f64>,
    pub rate_2000_cents: Option<f64>,
    pub monthly_bill_1000: Option<f64>,
    pub monthly_bill_2000: Option<f64>,
    pub early_termination_fee: Option<f64>,
    pub base_monthly_fee: Option<f64>,
    pub renewable_percent: Option<f64>,
    pub special_features: Option<String>,
    pub plan_url: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl Plan {
    fn apply_record(&mut self, record: &PlanRecord, now: DateTime<Utc>) {
        self.plan_name = record.plan_name.clone();
        self.plan_type = record.plan_type;
        self.service_type = record.service_type;
        self.zip_code = record.zip_code.clone();
        self.contract_months = record.contract_months.map(|m| m as i32);
        self.rate_500_cents = record.rate_500_cents;
        self.rate_1000_cents = record.rate_1000_cents;
        self.rate_2000_cents = record.rate_2000_cents;
        self.monthly_bill_1000 = record.monthly_bill_1000;
        self.monthly_bill_2000 = record.monthly_bill_2000;
        self.early_termination_fee = record.early_termination_fee;
        self.base_monthly_fee = record.base_monthly_fee;
        self.renewable_percent = record.renewable_percent;
        self.special_features = record.special_features.clone();
        self.plan_url = record.plan_url.clone();
        self.last_updated = now;
    }
}

#[derive(Debug, Default, Clone)]
pub struct PlanFilter {
    pub provider: Option<String>,
    pub plan_type: Option<PlanType>,
    pub service_type: Option<ServiceType>,
    pub contract_months: Option<u32>,
    pub limit: Option<u32>,
}

impl PlanFilter {
    fn effective_limit(&self) -> i64 {
        i64::from(self.limit.unwrap_or(100))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Keyed provider/plan persistence. Implementations must keep the
/// `(provider_id, plan_name)` pair unique; providers are unique by name.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn provider_by_name(&self, name: &str) -> Result<Option<Provider>, StoreError>;
    async fn create_provider(
        &self,
        name: &str,
        website: Option<&str>,
    ) -> Result<Provider, StoreError>;
    async fn list_providers(&self) -> Result<Vec<Provider>, StoreError>;

    async fn plan_by_id(&self, id: i64) -> Result<Option<Plan>, StoreError>;
    async fn find_plan(&self, provider_id: i64, plan_name: &str)
        -> Result<Option<Plan>, StoreError>;
    async fn list_plans(&self, filter: &PlanFilter) -> Result<Vec<Plan>, StoreError>;
    async fn insert_plan(
        &self,
        provider_id: i64,
        record: &PlanRecord,
        now: DateTime<Utc>,
    ) -> Result<Plan, StoreError>;
    async fn update_plan(
        &self,
        plan_id: i64,
        record: &PlanRecord,
        now: DateTime<Utc>,
    ) -> Result<Plan, StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
}

enum UpsertOutcome {
    Added,
    Updated,
}

/// Map every record onto a persisted provider/plan pair: create the
/// provider on first sighting, then insert or fully overwrite the plan
/// keyed by `(provider_id, plan_name)`.
///
/// Idempotent: a second pass over the same records only updates. Records
/// that fail to write are logged and skipped; counts reflect successful
/// writes only.
pub async fn reconcile(store: &dyn PlanStore, records: &[PlanRecord]) -> ReconcileSummary {
    let mut summary = ReconcileSummary::default();
    let now = Utc::now();
    for record in records {
        if record.provider_name.trim().is_empty() || record.plan_name.trim().is_empty() {
            summary.skipped += 1;
            continue;
        }
        match upsert_record(store, record, now).await {
            Ok(UpsertOutcome::Added) => summary.added += 1,
            Ok(UpsertOutcome::Updated) => summary.updated += 1,
            Err(err) => {
                warn!(
                    provider = %record.provider_name,
                    plan = %record.plan_name,
                    %err,
                    "skipping plan record after store failure"
                );
                summary.skipped += 1;
            }
        }
    }
    summary
}

async fn upsert_record(
    store: &dyn PlanStore,
    record: &PlanRecord,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, StoreError> {
    let provider = match store.provider_by_name(&record.provider_name).await? {
        Some(provider) => provider,
        None => {
            let website = providers::website_for(&record.provider_name);
            store.create_provider(&record.provider_name, website).await?
        }
    };

    let mut record = record.clone();
    if record.plan_url.is_none() {
        record.plan_url = providers::plan_url_for(&record.provider_name).map(String::from);
    }
    // Extractors leave term and fees unset when a page omits them; the
    // stored row gets the standard 12-month term and zero fees instead.
    record.contract_months.get_or_insert(12);
    record.early_termination_fee.get_or_insert(0.0);
    record.base_monthly_fee.get_or_insert(0.0);
    record.renewable_percent.get_or_insert(0.0);

    match store.find_plan(provider.id, &record.plan_name).await? {
        Some(existing) => {
            store.update_plan(existing.id, &record, now).await?;
            Ok(UpsertOutcome::Updated)
        }
        None => {
            store.insert_plan(provider.id, &record, now).await?;
            Ok(UpsertOutcome::Added)
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    providers: Vec<Provider>,
    plans: Vec<Plan>,
    next_provider_id: i64,
    next_plan_id: i64,
}

/// In-memory store used by tests and by `repwatch-cli` when no
/// `DATABASE_URL` is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn provider_by_name(&self, name: &str) -> Result<Option<Provider>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.providers.iter().find(|p| p.name == name).cloned())
    }

    async fn create_provider(
        &self,
        name: &str,
        website: Option<&str>,
    ) -> Result<Provider, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.providers.iter().any(|p| p.name == name) {
            return Err(StoreError::Message(format!(
                "provider {name} already exists"
            )));
        }
        inner.next_provider_id += 1;
        let provider = Provider {
            id: inner.next_provider_id,
            name: name.to_string(),
            website: website.map(String::from),
        };
        inner.providers.push(provider.clone());
        Ok(provider)
    }

    async fn list_providers(&self) -> Result<Vec<Provider>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.providers.clone())
    }

    async fn plan_by_id(&self, id: i64) -> Result<Option<Plan>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.plans.iter().find(|p| p.id == id).cloned())
    }

    async fn find_plan(
        &self,
        provider_id: i64,
        plan_name: &str,
    ) -> Result<Option<Plan>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .plans
            .iter()
            .find(|p| p.provider_id == provider_id && p.plan_name == plan_name)
            .cloned())
    }

    async fn list_plans(&self, filter: &PlanFilter) -> Result<Vec<Plan>, StoreError> {
        let inner = self.inner.lock().await;
        let provider_id = match &filter.provider {
            Some(name) => match inner.providers.iter().find(|p| &p.name == name) {
                Some(provider) => Some(provider.id),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let mut plans: Vec<Plan> = inner
            .plans
            .iter()
            .filter(|p| provider_id.map_or(true, |id| p.provider_id == id))
            .filter(|p| filter.plan_type.map_or(true, |t| p.plan_type == t))
            .filter(|p| filter.service_type.map_or(true, |t| p.service_type == t))
            .filter(|p| {
                filter
                    .contract_months
                    .map_or(true, |m| p.contract_months == Some(m as i32))
            })
            .cloned()
            .collect();
        // Cheapest first, unknown rates last.
        plans.sort_by(|a, b| match (a.rate_1000_cents, b.rate_1000_cents) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        plans.truncate(filter.effective_limit() as usize);
        Ok(plans)
    }

    async fn insert_plan(
        &self,
        provider_id: i64,
        record: &PlanRecord,
        now: DateTime<Utc>,
    ) -> Result<Plan, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_plan_id += 1;
        let mut plan = Plan {
            id: inner.next_plan_id,
            provider_id,
            plan_name: record.plan_name.clone(),
            plan_type: record.plan_type,
            service_type: record.service_type,
            zip_code: None,
            contract_months: None,
            rate_500_cents: None,
            rate_1000_cents: None,
            rate_2000_cents: None,
            monthly_bill_1000: None,
            monthly_bill_2000: None,
            early_termination_fee: None,
            base_monthly_fee: None,
            renewable_percent: None,
            special_features: None,
            plan_url: None,
            last_updated: now,
        };
        plan.apply_record(record, now);
        inner.plans.push(plan.clone());
        Ok(plan)
    }

    async fn update_plan(
        &self,
        plan_id: i64,
        record: &PlanRecord,
        now: DateTime<Utc>,
    ) -> Result<Plan, StoreError> {
        let mut inner = self.inner.lock().await;
        let plan = inner
            .plans
            .iter_mut()
            .find(|p| p.id == plan_id)
            .ok_or_else(|| StoreError::Message(format!("plan {plan_id} not found")))?;
        plan.apply_record(record, now);
        Ok(plan.clone())
    }
}

/// Postgres-backed store using runtime queries against the conventional
/// `providers`/`plans` schema.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the two tables if they are missing. Schema evolution beyond
    /// this is handled operationally, not here.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS providers (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                website TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                id BIGSERIAL PRIMARY KEY,
                provider_id BIGINT NOT NULL REFERENCES providers(id),
                plan_name TEXT NOT NULL,
                plan_type TEXT,
                service_type TEXT,
                zip_code TEXT,
                contract_months INT,
                rate_500_cents DOUBLE PRECISION,
                rate_1000_cents DOUBLE PRECISION,
                rate_2000_cents DOUBLE PRECISION,
                monthly_bill_1000 DOUBLE PRECISION,
                monthly_bill_2000 DOUBLE PRECISION,
                early_termination_fee DOUBLE PRECISION,
                base_monthly_fee DOUBLE PRECISION,
                renewable_percent DOUBLE PRECISION,
                special_features TEXT,
                plan_url TEXT,
                last_updated TIMESTAMPTZ NOT NULL,
                UNIQUE (provider_id, plan_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn plan_from_row(row: &sqlx::postgres::PgRow) -> Result<Plan, StoreError> {
        let plan_type: Option<String> = row.try_get("plan_type")?;
        let service_type: Option<String> = row.try_get("service_type")?;
        Ok(Plan {
            id: row.try_get("id")?,
            provider_id: row.try_get("provider_id")?,
            plan_name: row.try_get("plan_name")?,
            plan_type: plan_type
                .as_deref()
                .and_then(PlanType::parse)
                .unwrap_or_default(),
            service_type: service_type
                .as_deref()
                .and_then(ServiceType::parse)
                .unwrap_or_default(),
            zip_code: row.try_get("zip_code")?,
            contract_months: row.try_get("contract_months")?,
            rate_500_cents: row.try_get("rate_500_cents")?,
            rate_1000_cents: row.try_get("rate_1000_cents")?,
            rate_2000_cents: row.try_get("rate_2000_cents")?,
            monthly_bill_1000: row.try_get("monthly_bill_1000")?,
            monthly_bill_2000: row.try_get("monthly_bill_2000")?,
            early_termination_fee: row.try_get("early_termination_fee")?,
            base_monthly_fee: row.try_get("base_monthly_fee")?,
            renewable_percent: row.try_get("renewable_percent")?,
            special_features: row.try_get("special_features")?,
            plan_url: row.try_get("plan_url")?,
            last_updated: row.try_get("last_updated")?,
        })
    }
}

const PLAN_COLUMNS: &str = "id, provider_id, plan_name, plan_type, service_type, zip_code, \
     contract_months, rate_500_cents, rate_1000_cents, rate_2000_cents, monthly_bill_1000, \
     monthly_bill_2000, early_termination_fee, base_monthly_fee, renewable_percent, \
     special_features, plan_url, last_updated";

#[async_trait]
impl PlanStore for PgStore {
    async fn provider_by_name(&self, name: &str) -> Result<Option<Provider>, StoreError> {
        let row = sqlx::query("SELECT id, name, website FROM providers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| {
                Ok::<_, StoreError>(Provider {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    website: row.try_get("website")?,
                })
            })
            .transpose()?)
    }

    async fn create_provider(
        &self,
        name: &str,
        website: Option<&str>,
    ) -> Result<Provider, StoreError> {
        let row = sqlx::query(
            "INSERT INTO providers (name, website) VALUES ($1, $2) RETURNING id, name, website",
        )
        .bind(name)
        .bind(website)
        .fetch_one(&self.pool)
        .await?;
        Ok(Provider {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            website: row.try_get("website")?,
        })
    }

    async fn list_providers(&self) -> Result<Vec<Provider>, StoreError> {
        let rows = sqlx::query("SELECT id, name, website FROM providers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Provider {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    website: row.try_get("website")?,
                })
            })
            .collect()
    }

    async fn plan_by_id(&self, id: i64) -> Result<Option<Plan>, StoreError> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| Self::plan_from_row(&row)).transpose()
    }

    async fn find_plan(
        &self,
        provider_id: i64,
        plan_name: &str,
    ) -> Result<Option<Plan>, StoreError> {
        let sql =
            format!("SELECT {PLAN_COLUMNS} FROM plans WHERE provider_id = $1 AND plan_name = $2");
        let row = sqlx::query(&sql)
            .bind(provider_id)
            .bind(plan_name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Self::plan_from_row(&row)).transpose()
    }

    async fn list_plans(&self, filter: &PlanFilter) -> Result<Vec<Plan>, StoreError> {
        let sql = format!(
            r#"
            SELECT {PLAN_COLUMNS} FROM plans
             WHERE ($1::text IS NULL
                    OR provider_id = (SELECT id FROM providers WHERE name = $1))
               AND ($2::text IS NULL OR plan_type = $2)
               AND ($3::text IS NULL OR service_type = $3)
               AND ($4::int IS NULL OR contract_months = $4)
             ORDER BY rate_1000_cents ASC NULLS LAST
             LIMIT $5
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.provider.as_deref())
            .bind(filter.plan_type.map(|t| t.as_str()))
            .bind(filter.service_type.map(|t| t.as_str()))
            .bind(filter.contract_months.map(|m| m as i32))
            .bind(filter.effective_limit())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::plan_from_row).collect()
    }

    async fn insert_plan(
        &self,
        provider_id: i64,
        record: &PlanRecord,
        now: DateTime<Utc>,
    ) -> Result<Plan, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO plans (provider_id, plan_name, plan_type, service_type, zip_code,
                               contract_months, rate_500_cents, rate_1000_cents, rate_2000_cents,
                               monthly_bill_1000, monthly_bill_2000, early_termination_fee,
                               base_monthly_fee, renewable_percent, special_features, plan_url,
                               last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {PLAN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(provider_id)
            .bind(&record.plan_name)
            .bind(record.plan_type.as_str())
            .bind(record.service_type.as_str())
            .bind(record.zip_code.as_deref())
            .bind(record.contract_months.map(|m| m as i32))
            .bind(record.rate_500_cents)
            .bind(record.rate_1000_cents)
            .bind(record.rate_2000_cents)
            .bind(record.monthly_bill_1000)
            .bind(record.monthly_bill_2000)
            .bind(record.early_termination_fee)
            .bind(record.base_monthly_fee)
            .bind(record.renewable_percent)
            .bind(record.special_features.as_deref())
            .bind(record.plan_url.as_deref())
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Self::plan_from_row(&row)
    }

    async fn update_plan(
        &self,
        plan_id: i64,
        record: &PlanRecord,
        now: DateTime<Utc>,
    ) -> Result<Plan, StoreError> {
        let sql = format!(
            r#"
            UPDATE plans
               SET plan_name = $2, plan_type = $3, service_type = $4, zip_code = $5,
                   contract_months = $6, rate_500_cents = $7, rate_1000_cents = $8,
                   rate_2000_cents = $9, monthly_bill_1000 = $10, monthly_bill_2000 = $11,
                   early_termination_fee = $12, base_monthly_fee = $13, renewable_percent = $14,
                   special_features = $15, plan_url = $16, last_updated = $17
             WHERE id = $1
            RETURNING {PLAN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(plan_id)
            .bind(&record.plan_name)
            .bind(record.plan_type.as_str())
            .bind(record.service_type.as_str())
            .bind(record.zip_code.as_deref())
            .bind(record.contract_months.map(|m| m as i32))
            .bind(record.rate_500_cents)
            .bind(record.rate_1000_cents)
            .bind(record.rate_2000_cents)
            .bind(record.monthly_bill_1000)
            .bind(record.monthly_bill_2000)
            .bind(record.early_termination_fee)
            .bind(record.base_monthly_fee)
            .bind(record.renewable_percent)
            .bind(record.special_features.as_deref())
            .bind(record.plan_url.as_deref())
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Self::plan_from_row(&row)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_concurrency: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "repwatch-bot/0.1".to_string(),
            max_concurrency: 8,
        }
    }
}

/// One page to load: the target URL plus the optional ZIP code and
/// service-type selection some sites accept as query parameters.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub url: String,
    pub zip_code: Option<String>,
    pub service_type: Option<ServiceType>,
}

impl PageRequest {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            zip_code: None,
            service_type: None,
        }
    }

    fn effective_url(&self) -> String {
        let mut url = self.url.clone();
        let mut push = |key: &str, value: &str, url: &mut String| {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(key);
            url.push('=');
            url.push_str(value);
        };
        if let Some(zip) = &self.zip_code {
            push("zip", zip, &mut url);
        }
        if let Some(service) = self.service_type {
            let value = match service {
                ServiceType::Residential => "residential",
                ServiceType::Commercial => "commercial",
            };
            push("service", value, &mut url);
        }
        url
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub content_type: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("page load timed out for {url}")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// HTTP page loader with a bounded concurrency budget and an explicit
/// per-request timeout. Failed fetches are not retried here; the next
/// scheduled pipeline run is the retry mechanism. Never touches the store.
#[derive(Debug)]
pub struct SourceFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
}

impl SourceFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        })
    }

    pub async fn fetch(&self, request: &PageRequest) -> Result<FetchedPage, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let url = request.effective_url();

        async {
            let response = self.client.get(&url).send().await.map_err(|err| {
                if err.is_timeout() {
                    FetchError::Timeout { url: url.clone() }
                } else {
                    FetchError::Request(err)
                }
            })?;

            let status = response.status();
            let final_url = response.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("text/html")
                .to_string();
            let body = response.text().await.map_err(|err| {
                if err.is_timeout() {
                    FetchError::Timeout { url: url.clone() }
                } else {
                    FetchError::Request(err)
                }
            })?;

            Ok(FetchedPage {
                final_url,
                content_type,
                body,
                fetched_at: Utc::now(),
            })
        }
        .instrument(info_span!("page_fetch", url = %url))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider: &str, plan: &str, rate: Option<f64>) -> PlanRecord {
        let mut record = PlanRecord::new(provider, plan);
        record.rate_1000_cents = rate;
        record.contract_months = Some(12);
        record
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let store = MemoryStore::new();
        let records = vec![
            record("TXU Energy", "Business Value 12", Some(12.5)),
            record("Gexa Energy", "Business Choice 12", Some(11.7)),
            record("TXU Energy", "Business Advantage 24", Some(11.9)),
        ];

        let first = reconcile(&store, &records).await;
        assert_eq!(first.added, 3);
        assert_eq!(first.updated, 0);

        let second = reconcile(&store, &records).await;
        assert_eq!(second.added, 0);
        assert_eq!(second.updated, 3);

        let plans = store.list_plans(&PlanFilter::default()).await.unwrap();
        assert_eq!(plans.len(), 3);
        let providers = store.list_providers().await.unwrap();
        assert_eq!(providers.len(), 2);
    }

    #[tokio::test]
    async fn reconcile_leaves_stored_fields_identical_across_runs() {
        let store = MemoryStore::new();
        let mut rec = record("Reliant Energy", "Secure Advantage 12", Some(14.1));
        rec.special_features = Some("bill credit at 1000 kWh".into());

        reconcile(&store, std::slice::from_ref(&rec)).await;
        let first: Vec<_> = store
            .list_plans(&PlanFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|mut p| {
                p.last_updated = DateTime::<Utc>::MIN_UTC;
                p
            })
            .collect();

        reconcile(&store, std::slice::from_ref(&rec)).await;
        let second: Vec<_> = store
            .list_plans(&PlanFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|mut p| {
                p.last_updated = DateTime::<Utc>::MIN_UTC;
                p
            })
            .collect();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn reconcile_overwrites_all_fields_on_resighting() {
        let store = MemoryStore::new();
        let mut rec = record("TXU Energy", "Flex Forward", Some(13.0));
        rec.special_features = Some("3% cash-back loyalty reward".into());
        reconcile(&store, std::slice::from_ref(&rec)).await;

        // Next scrape no longer supplies the feature text; the field is
        // wiped rather than merged.
        let mut resupplied = record("TXU Energy", "Flex Forward", Some(13.2));
        resupplied.special_features = None;
        reconcile(&store, std::slice::from_ref(&resupplied)).await;

        let plans = store.list_plans(&PlanFilter::default()).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].rate_1000_cents, Some(13.2));
        assert_eq!(plans[0].special_features, None);
        // The URL backfill still applies because the record carried none.
        assert_eq!(
            plans[0].plan_url.as_deref(),
            Some("https://www.txu.com/shop/electricity-plans.html")
        );
    }

    #[tokio::test]
    async fn reconcile_backfills_provider_website() {
        let store = MemoryStore::new();
        reconcile(&store, &[record("Gexa Energy", "Saver 12", Some(13.2))]).await;
        let providers = store.list_providers().await.unwrap();
        assert_eq!(
            providers[0].website.as_deref(),
            Some("https://www.gexaenergy.com")
        );
    }

    #[tokio::test]
    async fn reconcile_fills_term_and_fee_defaults() {
        let store = MemoryStore::new();
        let mut rec = PlanRecord::new("4Change Energy", "Maxx Saver 12");
        rec.rate_1000_cents = Some(11.2);
        reconcile(&store, std::slice::from_ref(&rec)).await;

        let plans = store.list_plans(&PlanFilter::default()).await.unwrap();
        assert_eq!(plans[0].contract_months, Some(12));
        assert_eq!(plans[0].early_termination_fee, Some(0.0));
        assert_eq!(plans[0].base_monthly_fee, Some(0.0));
        assert_eq!(plans[0].renewable_percent, Some(0.0));
        // Rates stay unknown when a page omits them.
        assert_eq!(plans[0].rate_500_cents, None);
    }

    #[tokio::test]
    async fn reconcile_skips_blank_identities() {
        let store = MemoryStore::new();
        let summary = reconcile(
            &store,
            &[record("", "No Provider", Some(10.0)), record("TXU", "", None)],
        )
        .await;
        assert_eq!(summary.added, 0);
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test]
    async fn plan_listing_orders_by_rate_with_unknowns_last() {
        let store = MemoryStore::new();
        let records = vec![
            record("Reliant Energy", "Truly Free Weekends", None),
            record("TXU Energy", "Cheap 12", Some(10.2)),
            record("Gexa Energy", "Mid 12", Some(11.8)),
        ];
        reconcile(&store, &records).await;

        let plans = store.list_plans(&PlanFilter::default()).await.unwrap();
        let rates: Vec<_> = plans.iter().map(|p| p.rate_1000_cents).collect();
        assert_eq!(rates, vec![Some(10.2), Some(11.8), None]);
    }

    #[tokio::test]
    async fn plan_listing_filters_by_provider_and_term() {
        let store = MemoryStore::new();
        let mut a = record("TXU Energy", "Value 12", Some(12.5));
        a.contract_months = Some(12);
        let mut b = record("TXU Energy", "Value 24", Some(12.2));
        b.contract_months = Some(24);
        let c = record("Gexa Energy", "Choice 12", Some(11.7));
        reconcile(&store, &[a, b, c]).await;

        let filter = PlanFilter {
            provider: Some("TXU Energy".into()),
            contract_months: Some(24),
            ..Default::default()
        };
        let plans = store.list_plans(&filter).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].plan_name, "Value 24");

        let missing = PlanFilter {
            provider: Some("Nobody".into()),
            ..Default::default()
        };
        assert!(store.list_plans(&missing).await.unwrap().is_empty());
    }

    #[test]
    fn page_request_appends_zip_and_service_parameters() {
        let mut request = PageRequest::for_url("https://example.com/plans");
        request.zip_code = Some("75001".into());
        request.service_type = Some(ServiceType::Commercial);
        assert_eq!(
            request.effective_url(),
            "https://example.com/plans?zip=75001&service=commercial"
        );

        let mut with_query = PageRequest::for_url("https://example.com/plans?page=2");
        with_query.zip_code = Some("75001".into());
        assert_eq!(
            with_query.effective_url(),
            "https://example.com/plans?page=2&zip=75001"
        );
    }
}
