//! Pipeline orchestration: configuration, the scrape-then-reconcile run,
//! and the daily refresh scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use repwatch_core::ServiceType;
use repwatch_scrape::{aggregate, default_sources, PlanSource};
use repwatch_storage::{reconcile, FetchConfig, PlanStore, ReconcileSummary, SourceFetcher};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "repwatch-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    /// Six-field cron expression; defaults to 3:00 AM daily.
    pub scrape_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_concurrency: usize,
    pub bind_addr: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            scheduler_enabled: std::env::var("REPWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scrape_cron: std::env::var("REPWATCH_SCRAPE_CRON")
                .unwrap_or_else(|_| "0 0 3 * * *".to_string()),
            user_agent: std::env::var("REPWATCH_USER_AGENT")
                .unwrap_or_else(|_| "repwatch-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("REPWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            max_concurrency: std::env::var("REPWATCH_MAX_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            bind_addr: std::env::var("REPWATCH_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
        }
    }

    fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            max_concurrency: self.max_concurrency,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            scheduler_enabled: false,
            scrape_cron: "0 0 3 * * *".to_string(),
            user_agent: "repwatch-bot/0.1".to_string(),
            http_timeout_secs: 30,
            max_concurrency: 8,
            bind_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum SourceSelector {
    #[default]
    All,
    One(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown source {0}")]
    UnknownSource(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub scraped: usize,
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// One refresh cycle over the configured sources: aggregate all records,
/// then reconcile them into the store. Per-source and per-record failures
/// are absorbed; the summary counts whatever survived.
pub struct Pipeline {
    store: Arc<dyn PlanStore>,
    fetcher: SourceFetcher,
    sources: Vec<Arc<dyn PlanSource>>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn PlanStore>, config: &SyncConfig) -> Result<Self> {
        let fetcher = SourceFetcher::new(config.fetch_config()).context("building fetcher")?;
        Ok(Self {
            store,
            fetcher,
            sources: default_sources(),
        })
    }

    pub fn with_sources(mut self, sources: Vec<Arc<dyn PlanSource>>) -> Self {
        self.sources = sources;
        self
    }

    pub fn source_ids(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.source_id()).collect()
    }

    pub async fn run(&self) -> PipelineSummary {
        match self.run_selected(&SourceSelector::All, None).await {
            Ok(summary) => summary,
            // All-source runs cannot name an unknown source.
            Err(SyncError::UnknownSource(_)) => unreachable!(),
        }
    }

    pub async fn run_selected(
        &self,
        selector: &SourceSelector,
        service_type: Option<ServiceType>,
    ) -> Result<PipelineSummary, SyncError> {
        let selected: Vec<Arc<dyn PlanSource>> = match selector {
            SourceSelector::All => self.sources.clone(),
            SourceSelector::One(id) => {
                let source = self
                    .sources
                    .iter()
                    .find(|s| s.source_id() == id.as_str())
                    .cloned()
                    .ok_or_else(|| SyncError::UnknownSource(id.clone()))?;
                vec![source]
            }
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, sources = selected.len(), "pipeline run starting");

        let mut records = aggregate(&self.fetcher, &selected).await;
        if let Some(service) = service_type {
            records.retain(|record| record.service_type == service);
        }
        let scraped = records.len();
        let ReconcileSummary {
            added,
            updated,
            skipped,
        } = reconcile(self.store.as_ref(), &records).await;

        let finished_at = Utc::now();
        info!(
            %run_id,
            scraped, added, updated, skipped,
            "pipeline run finished"
        );

        Ok(PipelineSummary {
            run_id,
            started_at,
            finished_at,
            sources: selected.len(),
            scraped,
            added,
            updated,
            skipped,
        })
    }
}

/// Cron-driven refresh. Schedules the daily job and one immediate run so
/// a fresh deployment is populated without waiting for 3:00 AM.
pub struct PipelineScheduler {
    pipeline: Arc<Pipeline>,
    cron: String,
    scheduler: Option<JobScheduler>,
}

impl PipelineScheduler {
    pub fn new(pipeline: Arc<Pipeline>, cron: impl Into<String>) -> Self {
        Self {
            pipeline,
            cron: cron.into(),
            scheduler: None,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;

        let pipeline = self.pipeline.clone();
        let daily = Job::new_async(self.cron.as_str(), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                let summary = pipeline.run().await;
                info!(run_id = %summary.run_id, added = summary.added, updated = summary.updated, "scheduled refresh complete");
            })
        })
        .with_context(|| format!("creating job for cron {}", self.cron))?;
        scheduler.add(daily).await.context("adding daily job")?;

        let pipeline = self.pipeline.clone();
        let startup = Job::new_one_shot_async(Duration::from_secs(1), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                let summary = pipeline.run().await;
                info!(run_id = %summary.run_id, added = summary.added, updated = summary.updated, "startup refresh complete");
            })
        })
        .context("creating startup job")?;
        scheduler.add(startup).await.context("adding startup job")?;

        scheduler.start().await.context("starting scheduler")?;
        info!(cron = %self.cron, "scheduler started");
        self.scheduler = Some(scheduler);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler
                .shutdown()
                .await
                .context("shutting down scheduler")?;
            info!("scheduler stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use repwatch_core::PlanRecord;
    use repwatch_scrape::{ExtractError, ScrapeError};
    use repwatch_storage::{FetchedPage, MemoryStore, PageRequest, PlanFilter};

    struct StubSource {
        id: &'static str,
        records: Vec<PlanRecord>,
        fail: bool,
    }

    #[async_trait]
    impl PlanSource for StubSource {
        fn source_id(&self) -> &'static str {
            self.id
        }

        fn request(&self) -> PageRequest {
            PageRequest::for_url("https://example.com/unused")
        }

        fn extract(&self, _page: &FetchedPage) -> Result<Vec<PlanRecord>, ExtractError> {
            Ok(Vec::new())
        }

        async fn scrape(&self, _fetcher: &SourceFetcher) -> Result<Vec<PlanRecord>, ScrapeError> {
            if self.fail {
                Err(ScrapeError::Extract(ExtractError::Message(
                    "synthetic failure".to_string(),
                )))
            } else {
                Ok(self.records.clone())
            }
        }
    }

    fn record(provider: &str, plan: &str, rate: f64) -> PlanRecord {
        let mut record = PlanRecord::new(provider, plan);
        record.rate_1000_cents = Some(rate);
        record
    }

    fn pipeline_with(
        store: Arc<MemoryStore>,
        sources: Vec<Arc<dyn PlanSource>>,
    ) -> Pipeline {
        Pipeline::new(store, &SyncConfig::default())
            .unwrap()
            .with_sources(sources)
    }

    #[tokio::test]
    async fn repeat_runs_flip_added_to_updated() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            vec![Arc::new(StubSource {
                id: "stub",
                records: vec![
                    record("TXU Energy", "Value 12", 12.5),
                    record("Gexa Energy", "Choice 12", 11.7),
                ],
                fail: false,
            })],
        );

        let first = pipeline.run().await;
        assert_eq!(first.scraped, 2);
        assert_eq!(first.added, 2);
        assert_eq!(first.updated, 0);

        let second = pipeline.run().await;
        assert_eq!(second.added, 0);
        assert_eq!(second.updated, 2);

        let plans = store.list_plans(&PlanFilter::default()).await.unwrap();
        assert_eq!(plans.len(), 2);
    }

    #[tokio::test]
    async fn failing_source_still_persists_the_rest() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            vec![
                Arc::new(StubSource {
                    id: "broken",
                    records: Vec::new(),
                    fail: true,
                }),
                Arc::new(StubSource {
                    id: "ok",
                    records: vec![record("Reliant Energy", "Secure 12", 14.1)],
                    fail: false,
                }),
            ],
        );

        let summary = pipeline.run().await;
        assert_eq!(summary.scraped, 1);
        assert_eq!(summary.added, 1);
    }

    #[tokio::test]
    async fn single_source_selection() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            vec![
                Arc::new(StubSource {
                    id: "a",
                    records: vec![record("TXU Energy", "Value 12", 12.5)],
                    fail: false,
                }),
                Arc::new(StubSource {
                    id: "b",
                    records: vec![record("Gexa Energy", "Choice 12", 11.7)],
                    fail: false,
                }),
            ],
        );

        let summary = pipeline
            .run_selected(&SourceSelector::One("b".to_string()), None)
            .await
            .unwrap();
        assert_eq!(summary.sources, 1);
        assert_eq!(summary.added, 1);

        let plans = store.list_plans(&PlanFilter::default()).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].plan_name, "Choice 12");

        let err = pipeline
            .run_selected(&SourceSelector::One("nope".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownSource(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_startup_run_populates_store_before_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(pipeline_with(
            store.clone(),
            vec![Arc::new(StubSource {
                id: "stub",
                records: vec![record("TXU Energy", "Value 12", 12.5)],
                fail: false,
            })],
        ));

        let mut scheduler = PipelineScheduler::new(pipeline, "0 0 3 * * *");
        scheduler.start().await.unwrap();

        // The one-shot job fires about a second after start; the daily cron
        // stays pending for the life of the test.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            if !store.list_plans(&PlanFilter::default()).await.unwrap().is_empty() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "startup run never reached the store"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        scheduler.shutdown().await.unwrap();

        let plans = store.list_plans(&PlanFilter::default()).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].plan_name, "Value 12");
    }

    #[tokio::test]
    async fn service_type_filter_drops_other_segment() {
        let mut commercial = record("EnergyBot Retail", "Commercial 24", 9.8);
        commercial.service_type = ServiceType::Commercial;

        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            vec![Arc::new(StubSource {
                id: "mixed",
                records: vec![record("TXU Energy", "Value 12", 12.5), commercial],
                fail: false,
            })],
        );

        let summary = pipeline
            .run_selected(&SourceSelector::All, Some(ServiceType::Commercial))
            .await
            .unwrap();
        assert_eq!(summary.scraped, 1);
        assert_eq!(summary.added, 1);

        let plans = store.list_plans(&PlanFilter::default()).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].plan_name, "Commercial 24");
    }
}
