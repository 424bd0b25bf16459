//! Core domain model, field normalization, and TDU reference data.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "repwatch-core";

/// Plan pricing structure as advertised by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PlanType {
    #[default]
    Fixed,
    Variable,
    Solar,
    #[serde(rename = "Free Nights")]
    FreeNights,
    #[serde(rename = "Free Weekends")]
    FreeWeekends,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Fixed => "Fixed",
            PlanType::Variable => "Variable",
            PlanType::Solar => "Solar",
            PlanType::FreeNights => "Free Nights",
            PlanType::FreeWeekends => "Free Weekends",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "Fixed" => Some(PlanType::Fixed),
            "Variable" => Some(PlanType::Variable),
            "Solar" => Some(PlanType::Solar),
            "Free Nights" => Some(PlanType::FreeNights),
            "Free Weekends" => Some(PlanType::FreeWeekends),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ServiceType {
    #[default]
    Residential,
    Commercial,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Residential => "Residential",
            ServiceType::Commercial => "Commercial",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "Residential" => Some(ServiceType::Residential),
            "Commercial" => Some(ServiceType::Commercial),
            _ => None,
        }
    }
}

/// Transient pipeline record produced by an extractor, before reconciliation
/// against the persisted store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub provider_name: String,
    pub plan_name: String,
    pub plan_type: PlanType,
    pub service_type: ServiceType,
    pub zip_code: Option<String>,
    pub contract_months: Option<u32>,
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
    pub fetched_at: DateTime<Utc>,
}

impl PlanRecord {
    pub fn new(provider_name: impl Into<String>, plan_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            plan_name: plan_name.into(),
            plan_type: PlanType::Fixed,
            service_type: ServiceType::Residential,
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
            fetched_at: Utc::now(),
        }
    }

    /// Identity tuple used for cross-source deduplication. The rate is keyed
    /// on its bit pattern so that `None` and distinct floats stay distinct.
    pub fn dedup_key(&self) -> (String, String, Option<u64>, ServiceType) {
        (
            self.provider_name.clone(),
            self.plan_name.clone(),
            self.rate_1000_cents.map(f64::to_bits),
            self.service_type,
        )
    }
}

pub mod normalize {
    //! Pure text-to-value conversions shared by every extractor.

    use super::*;

    static MONTHS_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)(\d+)\s*(?:mo|month|mos)").expect("months regex"));

    /// Strip everything but digits and the decimal point, then parse.
    /// No unit interpretation; use for dollar amounts and bill figures.
    pub fn parse_amount(text: &str) -> Option<f64> {
        let cleaned: String = text
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if cleaned.is_empty() {
            return None;
        }
        cleaned.parse().ok()
    }

    /// Numeric strip plus the rate-unit heuristic: sites are inconsistent
    /// about quoting $/kWh versus cents/kWh, so a parsed value below 1.0 is
    /// treated as a dollar fraction and scaled to cents.
    pub fn parse_rate(text: &str) -> Option<f64> {
        let value = parse_amount(text)?;
        if value < 1.0 {
            Some(value * 100.0)
        } else {
            Some(value)
        }
    }

    /// First integer adjacent to a month-unit token ("12 mo", "24 months").
    pub fn parse_contract_months(text: &str) -> Option<u32> {
        MONTHS_RE
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Keyword classification with fixed precedence; first match wins and no
    /// multi-label classification is attempted.
    pub fn classify_plan_type(text: &str) -> PlanType {
        let lower = text.to_ascii_lowercase();
        if lower.contains("variable") {
            PlanType::Variable
        } else if lower.contains("solar") || lower.contains("renewable") {
            PlanType::Solar
        } else if lower.contains("free nights") {
            PlanType::FreeNights
        } else if lower.contains("free weekends") {
            PlanType::FreeWeekends
        } else {
            PlanType::Fixed
        }
    }
}

pub mod providers {
    //! Static directory of Texas retail electric providers (REPs), used to
    //! backfill provider websites and plan URLs that scraped pages omit.

    const WEBSITES: &[(&str, &str)] = &[
        ("Gexa Energy", "https://www.gexaenergy.com"),
        ("Gexa", "https://www.gexaenergy.com"),
        ("TXU Energy", "https://www.txu.com"),
        ("TXU", "https://www.txu.com"),
        ("Direct Energy", "https://www.directenergy.com"),
        ("Reliant Energy", "https://www.reliant.com"),
        ("Reliant", "https://www.reliant.com"),
        ("NRG Energy", "https://www.nrg.com"),
        ("Constellation", "https://www.constellation.com"),
        ("Green Mountain Energy", "https://www.greenmountainenergy.com"),
        ("Frontier Utilities", "https://www.frontierutilities.com"),
        ("Champion Energy", "https://www.championenergyservices.com"),
        ("Cirro Energy", "https://www.cirroenergy.com"),
        ("Pulse Power", "https://www.pulsepower.com"),
        ("4Change Energy", "https://www.4changeenergy.com"),
        ("Amigo Energy", "https://www.amigoenergy.com"),
        ("Just Energy", "https://www.justenergy.com"),
        ("Payless Power", "https://www.paylesspower.com"),
        ("Rhythm Energy", "https://www.rhythmenergy.com"),
        ("Chariot Energy", "https://www.gochariot.com"),
        ("Express Energy", "https://www.expressenergy.com"),
        ("TriEagle Energy", "https://www.trieagleenergy.com"),
        ("Discount Power", "https://www.discountpowertx.com"),
    ];

    const PLAN_PAGES: &[(&str, &str)] = &[
        ("Gexa Energy", "https://www.gexaenergy.com/electricity-plans"),
        ("Gexa", "https://www.gexaenergy.com/electricity-plans"),
        ("TXU Energy", "https://www.txu.com/shop/electricity-plans.html"),
        ("TXU", "https://www.txu.com/shop/electricity-plans.html"),
        (
            "Direct Energy",
            "https://www.directenergy.com/texas/electricity-plans",
        ),
        (
            "Reliant Energy",
            "https://www.reliant.com/en/residential/electricity/plans",
        ),
        (
            "Constellation",
            "https://www.constellation.com/solutions/for-your-home.html",
        ),
    ];

    pub fn website_for(provider_name: &str) -> Option<&'static str> {
        WEBSITES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(provider_name))
            .map(|(_, url)| *url)
    }

    /// Best customer-facing URL for a provider's plan listings, falling back
    /// to the provider homepage.
    pub fn plan_url_for(provider_name: &str) -> Option<&'static str> {
        PLAN_PAGES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(provider_name))
            .map(|(_, url)| *url)
            .or_else(|| website_for(provider_name))
    }
}

pub mod tdu {
    //! Texas TDU (Transmission and Distribution Utility) reference data.
    //!
    //! TDU delivery charges are regulated by the PUCT and change on March 1
    //! and September 1; the figures below are effective March 1, 2025 (LP&L
    //! joined ERCOT in 2024 and its rates are approximate).

    use serde::Serialize;

    #[derive(Debug, Clone, Copy, Serialize)]
    pub struct Tdu {
        pub name: &'static str,
        pub full_name: &'static str,
        pub website: &'static str,
        pub service_area: &'static str,
        pub major_cities: &'static str,
        pub customers: u64,
        pub monthly_charge: f64,
        pub delivery_charge_per_kwh: f64,
        pub rate_effective_date: &'static str,
    }

    const TEXAS_TDUS: &[Tdu] = &[
        Tdu {
            name: "Oncor",
            full_name: "Oncor Electric Delivery",
            website: "https://www.oncor.com",
            service_area: "Oncor is the largest TDU in Texas, serving over 10 million customers across Dallas, Fort Worth, and much of North and West Texas.",
            major_cities: "Dallas, Fort Worth, Arlington, Plano, Irving, Garland, Frisco, McKinney, Denton, Waco, Tyler, Odessa, Midland",
            customers: 10_000_000,
            monthly_charge: 4.23,
            delivery_charge_per_kwh: 5.0339,
            rate_effective_date: "2025-03-01",
        },
        Tdu {
            name: "CenterPoint",
            full_name: "CenterPoint Energy",
            website: "https://www.centerpointenergy.com",
            service_area: "CenterPoint Energy delivers electricity to over 2.2 million customers in the greater Houston metropolitan area and surrounding communities.",
            major_cities: "Houston, Katy, League City, Sugar Land, Pearland, Baytown, The Woodlands, Galveston",
            customers: 2_200_000,
            monthly_charge: 4.39,
            delivery_charge_per_kwh: 5.46944,
            rate_effective_date: "2025-03-01",
        },
        Tdu {
            name: "AEP Texas Central",
            full_name: "AEP Texas Central",
            website: "https://www.aeptexas.com",
            service_area: "AEP Texas Central serves over 2 million customers across 41 counties in South and Central Texas, including Corpus Christi, the Rio Grande Valley, and portions of the San Antonio area.",
            major_cities: "Corpus Christi, McAllen, Brownsville, Laredo, Harlingen, Edinburg, Pharr, Mission, San Benito, Kerrville",
            customers: 2_000_000,
            monthly_charge: 5.88,
            delivery_charge_per_kwh: 5.5226,
            rate_effective_date: "2025-03-01",
        },
        Tdu {
            name: "AEP Texas North",
            full_name: "AEP Texas North",
            website: "https://www.aeptexas.com",
            service_area: "AEP Texas North delivers power to customers in the Abilene area and surrounding regions of West-Central Texas.",
            major_cities: "Abilene, San Angelo, Sweetwater, Brownwood",
            customers: 250_000,
            monthly_charge: 5.88,
            delivery_charge_per_kwh: 5.1265,
            rate_effective_date: "2025-03-01",
        },
        Tdu {
            name: "TNMP",
            full_name: "Texas-New Mexico Power Company",
            website: "https://www.tnmp.com",
            service_area: "TNMP serves over 260,000 homes and businesses across various regions of Texas, including areas in West Texas, south of Houston, and portions of the Dallas-Fort Worth metroplex.",
            major_cities: "Texas City, Alvin, Pecos, Fort Stockton, Clifton, Bryson, Lewisville",
            customers: 260_000,
            monthly_charge: 7.85,
            delivery_charge_per_kwh: 6.0465,
            rate_effective_date: "2025-03-01",
        },
        Tdu {
            name: "LP&L",
            full_name: "Lubbock Power & Light",
            website: "https://www.lpandl.com",
            service_area: "LP&L serves over 100,000 customers in Lubbock and joined the ERCOT grid in early 2024, bringing energy choice to Lubbock residents.",
            major_cities: "Lubbock",
            customers: 100_000,
            monthly_charge: 3.50,
            delivery_charge_per_kwh: 4.50,
            rate_effective_date: "2024-01-01",
        },
    ];

    pub fn all() -> &'static [Tdu] {
        TEXAS_TDUS
    }

    pub fn by_name(name: &str) -> Option<&'static Tdu> {
        TEXAS_TDUS
            .iter()
            .find(|tdu| tdu.name.eq_ignore_ascii_case(name))
    }

    pub fn by_city(city: &str) -> Option<&'static Tdu> {
        let city_lower = city.to_ascii_lowercase();
        TEXAS_TDUS
            .iter()
            .find(|tdu| tdu.major_cities.to_ascii_lowercase().contains(&city_lower))
    }

    /// Monthly delivery cost in dollars: the fixed meter charge plus the
    /// per-kWh delivery charge (quoted in cents). Unknown TDU names cost 0.0
    /// rather than erroring; callers treat the TDU table as advisory.
    pub fn calculate_cost(tdu_name: &str, kwh_usage: f64) -> f64 {
        let Some(tdu) = by_name(tdu_name) else {
            return 0.0;
        };
        let total = tdu.monthly_charge + kwh_usage * (tdu.delivery_charge_per_kwh / 100.0);
        (total * 100.0).round() / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::normalize::*;
    use super::*;

    #[test]
    fn rate_parsing_strips_units() {
        assert_eq!(parse_rate("10.5¢/kWh"), Some(10.5));
        assert_eq!(parse_rate("12 cents per kWh"), Some(12.0));
        assert_eq!(parse_rate(""), None);
        assert_eq!(parse_rate("call for pricing"), None);
    }

    #[test]
    fn rate_parsing_scales_dollar_fractions() {
        assert_eq!(parse_rate("0.105"), Some(10.5));
        assert_eq!(parse_rate("0.089"), Some(8.9));
    }

    #[test]
    fn amount_parsing_never_rescales() {
        assert_eq!(parse_amount("$142"), Some(142.0));
        assert_eq!(parse_amount("$0.95"), Some(0.95));
        assert_eq!(parse_amount("no figure"), None);
    }

    #[test]
    fn contract_months_needs_a_unit_token() {
        assert_eq!(parse_contract_months("12 months"), Some(12));
        assert_eq!(parse_contract_months("24-month fixed"), Some(24));
        assert_eq!(parse_contract_months("36 mo term"), Some(36));
        assert_eq!(parse_contract_months("zip 75001"), None);
    }

    #[test]
    fn plan_type_precedence_is_first_match_wins() {
        assert_eq!(
            classify_plan_type("variable rate with solar buyback"),
            PlanType::Variable
        );
        assert_eq!(classify_plan_type("100% solar power"), PlanType::Solar);
        assert_eq!(classify_plan_type("renewable energy plan"), PlanType::Solar);
        assert_eq!(
            classify_plan_type("free nights 8pm-5am"),
            PlanType::FreeNights
        );
        assert_eq!(
            classify_plan_type("truly free weekends"),
            PlanType::FreeWeekends
        );
        assert_eq!(classify_plan_type("12 month secure"), PlanType::Fixed);
    }

    #[test]
    fn dedup_key_distinguishes_rate_and_service_type() {
        let mut a = PlanRecord::new("TXU Energy", "Business Value 12");
        a.rate_1000_cents = Some(12.5);
        let mut b = a.clone();
        b.special_features = Some("different text".into());
        assert_eq!(a.dedup_key(), b.dedup_key());

        let mut c = a.clone();
        c.rate_1000_cents = Some(12.6);
        assert_ne!(a.dedup_key(), c.dedup_key());

        let mut d = a.clone();
        d.service_type = ServiceType::Commercial;
        assert_ne!(a.dedup_key(), d.dedup_key());
    }

    #[test]
    fn tdu_cost_matches_published_oncor_rates() {
        assert_eq!(tdu::calculate_cost("Oncor", 1000.0), 54.57);
        assert_eq!(tdu::calculate_cost("oncor", 1000.0), 54.57);
    }

    #[test]
    fn tdu_cost_is_zero_for_unknown_utility() {
        assert_eq!(tdu::calculate_cost("NoSuchUtility", 1000.0), 0.0);
    }

    #[test]
    fn tdu_city_lookup() {
        assert_eq!(tdu::by_city("Houston").map(|t| t.name), Some("CenterPoint"));
        assert_eq!(tdu::by_city("Dallas").map(|t| t.name), Some("Oncor"));
        assert!(tdu::by_city("Chicago").is_none());
    }

    #[test]
    fn provider_directory_backfills_urls() {
        assert_eq!(
            providers::website_for("TXU Energy"),
            Some("https://www.txu.com")
        );
        assert_eq!(
            providers::plan_url_for("Gexa Energy"),
            Some("https://www.gexaenergy.com/electricity-plans")
        );
        // Falls back to the homepage when no plan page is known.
        assert_eq!(
            providers::plan_url_for("Pulse Power"),
            Some("https://www.pulsepower.com")
        );
        assert!(providers::website_for("Enron").is_none());
    }
}
