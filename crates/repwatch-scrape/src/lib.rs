//! Plan sources: per-site extractors behind a common trait, plus the
//! aggregation pass that merges their output into one deduplicated batch.
//!
//! Selectors were written against pages available in September 2025 and
//! will need occasional maintenance as the sites change.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use repwatch_core::{normalize, PlanRecord, PlanType, ServiceType};
use repwatch_storage::{FetchError, FetchedPage, PageRequest, SourceFetcher};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "repwatch-scrape";

const DEFAULT_ZIP: &str = "75001";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// One scrapeable site. `extract` is pure so it can be driven from inline
/// fixtures in tests; the default `scrape` wires it to a live fetch.
#[async_trait]
pub trait PlanSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn request(&self) -> PageRequest;

    fn extract(&self, page: &FetchedPage) -> Result<Vec<PlanRecord>, ExtractError>;

    async fn scrape(&self, fetcher: &SourceFetcher) -> Result<Vec<PlanRecord>, ScrapeError> {
        let page = fetcher.fetch(&self.request()).await?;
        Ok(self.extract(&page)?)
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector(e.to_string()))
}

fn element_text(element: &ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Text fragments of an element, one entry per text node, blanks dropped.
/// Stands in for line-by-line card parsing.
fn element_lines(element: &ElementRef) -> Vec<String> {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let mut out: String = text.chars().take(max).collect();
        out.push_str("...");
        out
    } else {
        text.to_string()
    }
}

static RATE_CENTS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:¢|cents?)").expect("rate regex"));
static FIRST_INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)").expect("int regex"));
static TERM_IN_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*month").expect("term regex"));
static DOUBLE_DASH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*-\s*-\s*").expect("dash regex"));

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

pub mod jsonld {
    //! Extraction from JSON-LD structured data embedded in aggregator pages.
    //! More stable than the surrounding HTML, which changes with every
    //! site redesign.

    use super::*;

    /// Commercial plan listings published as a schema.org `Product` whose
    /// `offers.offers` array carries one offer per plan.
    pub struct JsonLdSource {
        source_id: &'static str,
        url: &'static str,
        zip_code: String,
        max_records: usize,
    }

    pub fn energybot_commercial() -> JsonLdSource {
        JsonLdSource {
            source_id: "energybot-commercial",
            url: "https://www.energybot.com/electricity-rates/texas/business-commercial-electricity.html",
            zip_code: DEFAULT_ZIP.to_string(),
            max_records: 100,
        }
    }

    /// Offer titles arrive as "Provider - Provider - Term"; strip the
    /// provider name and collapse the leftover dashes. Names reduced to
    /// fewer than three characters get a synthetic term-based name.
    pub fn clean_plan_name(raw: &str, provider: &str) -> String {
        let mut name = if provider.is_empty() {
            raw.to_string()
        } else {
            raw.replace(provider, "")
        };
        name = DOUBLE_DASH_RE.replace_all(&name, " - ").to_string();
        let name = name.trim_matches([' ', '-']).to_string();
        if name.chars().count() >= 3 {
            return name;
        }
        match TERM_IN_NAME_RE.captures(raw).and_then(|c| c.get(1)) {
            Some(n) => format!("Commercial {} Month", n.as_str()),
            None => "Commercial Plan".to_string(),
        }
    }

    fn offer_to_record(offer: &JsonValue, zip_code: &str) -> Option<PlanRecord> {
        let provider_name = offer
            .get("offeredBy")
            .and_then(|o| o.get("name"))
            .and_then(JsonValue::as_str)
            .unwrap_or("Unknown Provider");
        let price_spec = offer.get("priceSpecification")?;
        let raw_plan_name = price_spec
            .get("name")
            .and_then(JsonValue::as_str)
            .unwrap_or("Unknown Plan");
        let plan_name = clean_plan_name(raw_plan_name, provider_name);

        // The offer price is quoted in dollars per kWh.
        let price_dollars = price_spec.get("price").and_then(JsonValue::as_f64)?;
        let rate_cents = round3(price_dollars * 100.0);

        let contract_months = TERM_IN_NAME_RE
            .captures(&plan_name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());

        let lower = plan_name.to_ascii_lowercase();
        let plan_type = if lower.contains("variable") {
            PlanType::Variable
        } else if lower.contains("solar") || lower.contains("green") {
            PlanType::Solar
        } else {
            PlanType::Fixed
        };

        let special_features = offer
            .get("description")
            .and_then(JsonValue::as_str)
            .map(|d| truncate_chars(d, 200));

        let mut record = PlanRecord::new(provider_name, plan_name);
        record.plan_type = plan_type;
        record.service_type = ServiceType::Commercial;
        record.zip_code = Some(zip_code.to_string());
        record.contract_months = contract_months;
        record.rate_1000_cents = Some(rate_cents);
        record.special_features = special_features;
        Some(record)
    }

    impl JsonLdSource {
        fn extract_document(&self, body: &str) -> Result<Vec<PlanRecord>, ExtractError> {
            let document = Html::parse_document(body);
            let script_sel = selector(r#"script[type="application/ld+json"]"#)?;
            let mut records = Vec::new();

            for script in document.select(&script_sel) {
                let text = script.text().collect::<String>();
                // Malformed blocks and non-Product payloads are common;
                // skip them rather than failing the source.
                let Ok(data) = serde_json::from_str::<JsonValue>(&text) else {
                    continue;
                };
                if data.get("@type").and_then(JsonValue::as_str) != Some("Product") {
                    continue;
                }
                let Some(offers) = data.get("offers").and_then(|a| a.get("offers")) else {
                    continue;
                };
                let Some(offers) = offers.as_array() else {
                    continue;
                };
                for offer in offers {
                    if let Some(record) = offer_to_record(offer, &self.zip_code) {
                        records.push(record);
                    }
                }
            }

            records.truncate(self.max_records);
            Ok(records)
        }
    }

    #[async_trait]
    impl PlanSource for JsonLdSource {
        fn source_id(&self) -> &'static str {
            self.source_id
        }

        fn request(&self) -> PageRequest {
            PageRequest::for_url(self.url)
        }

        fn extract(&self, page: &FetchedPage) -> Result<Vec<PlanRecord>, ExtractError> {
            self.extract_document(&page.body)
        }
    }
}

pub mod tables {
    //! Extraction from the plan comparison tables on review sites. Each
    //! variant keys on the term-column format its site uses to tell plan
    //! rows apart from prose tables.

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TableFlavor {
        /// Gexa-vs-TXU comparison article; provider comes from the plan
        /// name prefix and column four is the estimated monthly bill.
        GexaTxu,
        DirectEnergy,
        Reliant,
        Txu,
    }

    static TERM_MONTHS_WORD_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\d+\s*months").expect("term regex"));
    static TERM_SLASH_MONTHS_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\d+/months").expect("term regex"));
    static TERM_SLASH_UNIT_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\d+/\w+").expect("term regex"));

    pub struct ComparisonTableSource {
        source_id: &'static str,
        url: &'static str,
        flavor: TableFlavor,
    }

    pub fn gexa_txu() -> ComparisonTableSource {
        ComparisonTableSource {
            source_id: "choosetexaspower-gexa-txu",
            url: "https://www.choosetexaspower.org/electricity-providers/gexa-energy-vs-txu-energy-review/",
            flavor: TableFlavor::GexaTxu,
        }
    }

    pub fn direct_energy() -> ComparisonTableSource {
        ComparisonTableSource {
            source_id: "powerchoicetexas-direct-energy",
            url: "https://www.powerchoicetexas.org/providers/direct-energy",
            flavor: TableFlavor::DirectEnergy,
        }
    }

    pub fn reliant() -> ComparisonTableSource {
        ComparisonTableSource {
            source_id: "powerchoicetexas-reliant",
            url: "https://www.powerchoicetexas.org/providers/reliant-energy",
            flavor: TableFlavor::Reliant,
        }
    }

    pub fn txu() -> ComparisonTableSource {
        ComparisonTableSource {
            source_id: "powerchoicetexas-txu",
            url: "https://www.powerchoicetexas.org/providers/txu-energy",
            flavor: TableFlavor::Txu,
        }
    }

    impl ComparisonTableSource {
        fn term_matches(&self, text: &str) -> bool {
            match self.flavor {
                TableFlavor::GexaTxu => TERM_MONTHS_WORD_RE.is_match(text),
                TableFlavor::DirectEnergy | TableFlavor::Reliant => {
                    TERM_SLASH_MONTHS_RE.is_match(text)
                }
                // TXU's page mixes "12/months", "1/month" and "1/year".
                TableFlavor::Txu => TERM_SLASH_UNIT_RE.is_match(text),
            }
        }

        fn min_columns(&self) -> usize {
            match self.flavor {
                TableFlavor::GexaTxu => 4,
                _ => 3,
            }
        }

        fn row_to_record(&self, cols: &[String], row_text: &str) -> PlanRecord {
            let plan_name = cols[0].clone();
            let contract_months = FIRST_INT_RE
                .captures(&cols[1])
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok());
            let rate = normalize::parse_rate(&cols[2]);

            let provider_name = match self.flavor {
                TableFlavor::GexaTxu => {
                    if plan_name.to_ascii_lowercase().starts_with("gexa") {
                        "Gexa"
                    } else {
                        "TXU"
                    }
                }
                TableFlavor::DirectEnergy => "Direct Energy",
                TableFlavor::Reliant => "Reliant Energy",
                TableFlavor::Txu => "TXU Energy",
            };

            let mut record = PlanRecord::new(provider_name, plan_name);
            record.contract_months = contract_months;
            record.rate_1000_cents = rate;

            match self.flavor {
                TableFlavor::GexaTxu => {
                    // Bill column is a dollar figure; the rate-unit
                    // heuristic must not rescale it.
                    record.monthly_bill_1000 = normalize::parse_amount(&cols[3]);
                    if row_text.to_ascii_lowercase().contains("credit") {
                        record.special_features = Some(row_text.trim().to_string());
                    }
                }
                TableFlavor::DirectEnergy => {
                    if record.plan_name.contains("Twelve Hour Power") {
                        record.special_features =
                            Some("Free power between 9 p.m. and 9 a.m.".to_string());
                    }
                    if record.plan_name == "Live Brighter 12" {
                        record.early_termination_fee = Some(135.0);
                    }
                }
                TableFlavor::Reliant => {}
                TableFlavor::Txu => {
                    if record.plan_name.contains("Free Nights") {
                        record.plan_type = PlanType::FreeNights;
                        record.special_features = Some(
                            "Free electricity at night between 8 p.m. and 5 a.m.".to_string(),
                        );
                    } else if record.plan_name.contains("Flex Forward") {
                        record.plan_type = PlanType::Variable;
                        record.special_features = Some("3% cash-back loyalty reward".to_string());
                    } else if record.plan_name.contains("Solar") {
                        record.plan_type = PlanType::Solar;
                        record.special_features = Some(
                            "Includes bill credit when usage exceeds 800 or 1,200 kWh".to_string(),
                        );
                    }
                }
            }
            record
        }

        fn extract_document(&self, body: &str) -> Result<Vec<PlanRecord>, ExtractError> {
            let document = Html::parse_document(body);
            let row_sel = selector("tr")?;
            let cell_sel = selector("td, th")?;
            let mut records = Vec::new();

            for row in document.select(&row_sel) {
                let cols: Vec<String> = row
                    .select(&cell_sel)
                    .map(|cell| element_text(&cell))
                    .collect();
                if cols.len() < self.min_columns() || !self.term_matches(&cols[1]) {
                    continue;
                }
                records.push(self.row_to_record(&cols, &element_text(&row)));
            }

            if self.flavor == TableFlavor::Reliant {
                // Time-of-use specialty plans never appear in the rate
                // tables; carry them with no rate.
                let mut weekends = PlanRecord::new("Reliant Energy", "Truly Free Weekends");
                weekends.plan_type = PlanType::FreeWeekends;
                weekends.special_features =
                    Some("Free electricity on weekends; higher weekday rates".to_string());
                records.push(weekends);

                let mut nights = PlanRecord::new("Reliant Energy", "Truly Free Nights");
                nights.plan_type = PlanType::FreeNights;
                nights.special_features =
                    Some("Free electricity at night; higher daytime rates".to_string());
                records.push(nights);
            }

            Ok(records)
        }
    }

    #[async_trait]
    impl PlanSource for ComparisonTableSource {
        fn source_id(&self) -> &'static str {
            self.source_id
        }

        fn request(&self) -> PageRequest {
            PageRequest::for_url(self.url)
        }

        fn extract(&self, page: &FetchedPage) -> Result<Vec<PlanRecord>, ExtractError> {
            self.extract_document(&page.body)
        }
    }
}

pub mod cards {
    //! Extraction from provider shop pages that render plans as card
    //! markup. Class names differ per deploy, so a prioritized selector
    //! list is probed until one yields enough elements to look like a
    //! plan grid.

    use super::*;

    const RATE_SANITY_MIN: f64 = 5.0;
    const RATE_SANITY_MAX: f64 = 20.0;
    const TERM_SANITY_MAX: u32 = 36;
    // Fewer matches than this means the selector hit page chrome, not
    // the plan grid.
    const MIN_CARD_ELEMENTS: usize = 3;

    pub struct CardSource {
        source_id: &'static str,
        provider_name: &'static str,
        url: &'static str,
        card_selectors: &'static [&'static str],
        name_keywords: &'static [&'static str],
        service_type: ServiceType,
        zip_code: String,
        max_records: usize,
    }

    pub fn txu_business() -> CardSource {
        CardSource {
            source_id: "txu-business",
            provider_name: "TXU Energy",
            url: "https://www.txu.com/business.aspx",
            card_selectors: &[
                r#"[class*="plan-card"]"#,
                r#"[class*="product-card"]"#,
                r#"[class*="plan"]"#,
                r#"[class*="card"]"#,
                "article",
                ".plan-tile",
                "[data-plan]",
                "[data-product]",
            ],
            name_keywords: &["business", "advantage", "value", "commercial", "fixed", "plan"],
            service_type: ServiceType::Commercial,
            zip_code: DEFAULT_ZIP.to_string(),
            max_records: 50,
        }
    }

    pub fn reliant_business() -> CardSource {
        CardSource {
            source_id: "reliant-business",
            provider_name: "Reliant Energy",
            url: "https://shop.reliant.com/business",
            card_selectors: &[
                r#"[class*="plan"]"#,
                r#"[class*="card"]"#,
                r#"[class*="product"]"#,
                "article",
                ".plan-tile",
                ".product-card",
            ],
            name_keywords: &["flextra", "secure", "advantage", "apartment", "power plus"],
            service_type: ServiceType::Commercial,
            zip_code: DEFAULT_ZIP.to_string(),
            max_records: 50,
        }
    }

    fn rate_within_sanity(rate: f64) -> bool {
        (RATE_SANITY_MIN..=RATE_SANITY_MAX).contains(&rate)
    }

    impl CardSource {
        fn plan_name_from_lines<'a>(&self, lines: &'a [String]) -> Option<&'a str> {
            let first = lines.first().map(String::as_str)?;
            let first_lower = first.to_ascii_lowercase();
            if self
                .name_keywords
                .iter()
                .any(|kw| first_lower.contains(kw))
            {
                return Some(first);
            }
            lines
                .iter()
                .map(String::as_str)
                .find(|line| {
                    let lower = line.to_ascii_lowercase();
                    self.name_keywords.iter().any(|kw| lower.contains(kw))
                })
                .or(Some(first))
        }

        fn card_to_record(&self, element: &ElementRef) -> Option<PlanRecord> {
            let lines = element_lines(element);
            let text = lines.join("\n");

            let rate = RATE_CENTS_RE
                .captures(&text)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .filter(|rate| rate_within_sanity(*rate))?;

            let raw_name = self.plan_name_from_lines(&lines)?;
            let plan_name = raw_name
                .replace(self.provider_name, "")
                .replace("TXU", "")
                .trim_matches([' ', '-'])
                .to_string();
            if plan_name.is_empty() {
                return None;
            }

            let contract_months = normalize::parse_contract_months(&text)
                .filter(|months| *months <= TERM_SANITY_MAX);

            let lower = text.to_ascii_lowercase();
            let plan_type = if lower.contains("variable") {
                PlanType::Variable
            } else if lower.contains("solar") || text.contains("100%") || lower.contains("renewable")
            {
                PlanType::Solar
            } else {
                PlanType::Fixed
            };

            const FEATURE_KEYWORDS: &[&str] = &[
                "free", "credit", "reward", "nights", "weekends", "green", "renewable",
            ];
            let special_features = lines.iter().find_map(|line| {
                let lower = line.to_ascii_lowercase();
                FEATURE_KEYWORDS
                    .iter()
                    .any(|kw| lower.contains(kw))
                    .then(|| truncate_chars(line, 200))
            });

            let mut record = PlanRecord::new(self.provider_name, truncate_chars(&plan_name, 200));
            record.plan_type = plan_type;
            record.service_type = self.service_type;
            record.zip_code = Some(self.zip_code.clone());
            record.contract_months = contract_months;
            record.rate_1000_cents = Some(round3(rate));
            record.special_features = special_features;
            Some(record)
        }

        fn extract_document(&self, body: &str) -> Result<Vec<PlanRecord>, ExtractError> {
            let document = Html::parse_document(body);

            let mut cards = Vec::new();
            for css in self.card_selectors {
                let sel = selector(css)?;
                let matched: Vec<ElementRef> = document.select(&sel).collect();
                if matched.len() >= MIN_CARD_ELEMENTS {
                    cards = matched;
                    break;
                }
            }

            let records: Vec<PlanRecord> = cards
                .iter()
                .take(self.max_records)
                .filter_map(|card| self.card_to_record(card))
                .collect();
            Ok(records)
        }
    }

    #[async_trait]
    impl PlanSource for CardSource {
        fn source_id(&self) -> &'static str {
            self.source_id
        }

        fn request(&self) -> PageRequest {
            let mut request = PageRequest::for_url(self.url);
            request.zip_code = Some(self.zip_code.clone());
            request
        }

        fn extract(&self, page: &FetchedPage) -> Result<Vec<PlanRecord>, ExtractError> {
            self.extract_document(&page.body)
        }
    }
}

/// Every production source, in the order their records win deduplication.
pub fn default_sources() -> Vec<Arc<dyn PlanSource>> {
    vec![
        Arc::new(tables::gexa_txu()),
        Arc::new(tables::direct_energy()),
        Arc::new(tables::reliant()),
        Arc::new(tables::txu()),
        Arc::new(jsonld::energybot_commercial()),
        Arc::new(cards::txu_business()),
        Arc::new(cards::reliant_business()),
    ]
}

pub fn source_by_id(source_id: &str) -> Option<Arc<dyn PlanSource>> {
    default_sources()
        .into_iter()
        .find(|source| source.source_id() == source_id)
}

/// Run every source and merge the results into one batch.
///
/// A failing source is logged and dropped without disturbing the others.
/// Duplicate records (same provider, plan name, rate bit pattern, and
/// service type) keep the first sighting. Every surviving record is
/// stamped with one shared batch timestamp.
pub async fn aggregate(
    fetcher: &SourceFetcher,
    sources: &[Arc<dyn PlanSource>],
) -> Vec<PlanRecord> {
    let results = join_all(
        sources
            .iter()
            .map(|source| async move { (source.source_id(), source.scrape(fetcher).await) }),
    )
    .await;

    let fetched_at = Utc::now();
    let mut seen = HashSet::new();
    let mut merged = Vec::new();

    for (source_id, result) in results {
        match result {
            Ok(records) => {
                let before = merged.len();
                for mut record in records {
                    if seen.insert(record.dedup_key()) {
                        record.fetched_at = fetched_at;
                        merged.push(record);
                    }
                }
                info!(
                    source = source_id,
                    records = merged.len() - before,
                    "source extracted"
                );
            }
            Err(err) => {
                warn!(source = source_id, %err, "source failed, continuing without it");
            }
        }
    }

    merged
}
