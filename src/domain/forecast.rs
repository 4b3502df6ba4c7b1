use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Branch label carried on every forecast line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    LastOrderAnchor,
    ScheduleAware,
    StoreCentric,
    SlowIntermittent,
    ExpiryReplacement,
}

impl SourceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::LastOrderAnchor => "last_order_anchor",
            SourceTag::ScheduleAware => "schedule_aware",
            SourceTag::StoreCentric => "store_centric",
            SourceTag::SlowIntermittent => "slow_intermittent",
            SourceTag::ExpiryReplacement => "expiry_replacement",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "last_order_anchor" => Some(SourceTag::LastOrderAnchor),
            "schedule_aware" => Some(SourceTag::ScheduleAware),
            "store_centric" => Some(SourceTag::StoreCentric),
            "slow_intermittent" => Some(SourceTag::SlowIntermittent),
            "expiry_replacement" => Some(SourceTag::ExpiryReplacement),
            _ => None,
        }
    }
}

/// Context about a prior order covering an overlapping delivery window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorOrderContext {
    pub order_id: String,
    pub order_date: NaiveDate,
    pub delivery_date: NaiveDate,
    pub quantity: u32,
    pub schedule_key: String,
}

/// Metadata for lines injected or floored by low-quantity expiry handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryReplacement {
    pub expiry_date: NaiveDate,
    pub min_units_required: u32,
    pub reason: String,
}

/// A low-quantity floor entry supplied by the external low-quantity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryFloor {
    pub store_id: String,
    pub sap: String,
    pub expiry_date: NaiveDate,
    pub min_units_required: u32,
}

/// Record of a whole-case enforcement adjustment on one line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WholeCaseAdjustment {
    pub pre_units: u32,
    pub post_units: u32,
    pub case_pack: u32,
    pub trigger: String,
    /// Store that absorbed the SAP-level residual, when any.
    pub absorber_store_id: Option<String>,
}

/// One forecast line for a (store, sap) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastItem {
    pub store_id: String,
    pub store_name: String,
    pub sap: String,
    pub recommended_units: u32,
    pub recommended_cases: Option<f64>,
    pub p10_units: f64,
    pub p50_units: f64,
    pub p90_units: f64,
    #[serde(default)]
    pub promo_active: bool,
    pub promo_lift_pct: Option<f64>,
    pub is_first_weekend: Option<bool>,
    /// Calibrated confidence in [0, 1].
    pub confidence: f64,
    pub source: SourceTag,
    pub prior_order_context: Option<PriorOrderContext>,
    pub last_order_quantity: Option<u32>,
    pub expiry_replacement: Option<ExpiryReplacement>,
    pub whole_case_adjustment: Option<WholeCaseAdjustment>,
    /// Pass-through meta preserved across the store boundary.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl ForecastItem {
    pub fn band_is_monotone(&self) -> bool {
        self.p10_units <= self.p50_units && self.p50_units <= self.p90_units
    }
}

/// Full forecast for one (route, delivery_date, schedule).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastPayload {
    pub forecast_id: String,
    pub route_number: String,
    pub delivery_date: NaiveDate,
    pub schedule_key: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub items: Vec<ForecastItem>,
}

impl ForecastPayload {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_tag_round_trip() {
        for tag in [
            SourceTag::LastOrderAnchor,
            SourceTag::ScheduleAware,
            SourceTag::StoreCentric,
            SourceTag::SlowIntermittent,
            SourceTag::ExpiryReplacement,
        ] {
            assert_eq!(SourceTag::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(SourceTag::parse("missing_pred"), None);
    }

    #[test]
    fn payload_expiry() {
        let now = Utc::now();
        let payload = ForecastPayload {
            forecast_id: "f1".into(),
            route_number: "989262".into(),
            delivery_date: NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(),
            schedule_key: "monday".into(),
            generated_at: now,
            expires_at: now + chrono::Duration::days(7),
            items: vec![],
        };
        assert!(!payload.is_expired(now));
        assert!(payload.is_expired(now + chrono::Duration::days(8)));
    }
}
