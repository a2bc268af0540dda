//! Tuya smart-scale cloud client with incremental, enriched history sync.
//!
//! The crate signs requests the way the Tuya OpenAPI expects, keeps an access
//! token fresh, walks the measurement history of one scale and asks the cloud
//! for a body-composition report per measurement before appending everything
//! to a local JSON document.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

pub mod config;
pub mod enrich;
pub mod http_client;
pub mod observability;
pub mod paginator;
pub mod retry;
pub mod signer;
pub mod store;
pub mod sync;
pub mod token;
pub mod utils;
mod wire;

pub use signer::SigningError;

/// Vendor codes reported in the response envelope when `success` is false.
const TOKEN_EXPIRED_CODES: &[i64] = &[1010, 1011];
const INVALID_CREDENTIAL_CODES: &[i64] = &[1001, 1004, 1005, 1106];
const DEVICE_NOT_FOUND_CODES: &[i64] = &[2006];
const RATE_LIMITED_CODES: &[i64] = &[40000309];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScaleError {
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("access token expired: {0}")]
    TokenExpired(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("vendor error {code}: {msg}")]
    Unknown { code: i64, msg: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("pagination error: {0}")]
    Pagination(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("sync cancelled")]
    Cancelled,
}

impl ScaleError {
    /// Map a vendor error code from a `success: false` envelope.
    pub fn from_vendor(code: i64, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        if TOKEN_EXPIRED_CODES.contains(&code) {
            ScaleError::TokenExpired(msg)
        } else if INVALID_CREDENTIAL_CODES.contains(&code) {
            ScaleError::InvalidCredentials(msg)
        } else if DEVICE_NOT_FOUND_CODES.contains(&code) {
            ScaleError::DeviceNotFound(msg)
        } else if RATE_LIMITED_CODES.contains(&code) {
            ScaleError::RateLimited(msg)
        } else {
            ScaleError::Unknown { code, msg }
        }
    }

    /// Map a non-2xx HTTP status seen before any envelope could be read.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => ScaleError::RateLimited(body),
            408 | 500..=599 => ScaleError::Transport(format!("http {status}: {body}")),
            401 | 403 => ScaleError::InvalidCredentials(body),
            _ => ScaleError::Unknown {
                code: i64::from(status),
                msg: body,
            },
        }
    }
}

impl From<reqwest::Error> for ScaleError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ScaleError::Decode(err.to_string())
        } else {
            ScaleError::Transport(err.to_string())
        }
    }
}

/// Biological sex as the analysis endpoint encodes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    pub fn vendor_code(self) -> u8 {
        match self {
            Sex::Male => 1,
            Sex::Female => 2,
        }
    }
}

impl FromStr for Sex {
    type Err = ScaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "m" | "male" => Ok(Sex::Male),
            "2" | "f" | "female" => Ok(Sex::Female),
            other => Err(ScaleError::Config(format!("unknown sex: {other:?}"))),
        }
    }
}

/// One scale reading as delivered by the history endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct RawMeasurement {
    pub record_id: String,
    pub user_id: String,
    #[serde(default)]
    pub nickname: Option<String>,
    pub device_id: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Kilograms.
    pub weight: f64,
    /// Centimetres.
    pub height: f64,
    /// Ohms; zero when the scale could not measure impedance.
    pub body_resistance: f64,
}

impl RawMeasurement {
    pub fn has_resistance(&self) -> bool {
        self.body_resistance > 0.0
    }
}

/// Derived body-composition metrics for one measurement.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct AnalysisReport {
    pub bmi: Option<f64>,
    pub body_fat_pct: Option<f64>,
    pub muscle_mass: Option<f64>,
    pub body_water_pct: Option<f64>,
    pub bone_mass: Option<f64>,
    pub visceral_fat: Option<f64>,
    pub protein: Option<f64>,
    pub fat_free_mass: Option<f64>,
    pub metabolism: Option<f64>,
    pub body_age: Option<f64>,
    pub body_score: Option<f64>,
    pub body_type: Option<String>,
}

/// The persisted unit: a measurement plus its report when one was produced.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub measurement: RawMeasurement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_report: Option<AnalysisReport>,
}

impl EnrichedRecord {
    pub fn without_report(measurement: RawMeasurement) -> Self {
        Self {
            measurement,
            analysis_report: None,
        }
    }

    pub fn record_id(&self) -> &str {
        &self.measurement.record_id
    }

    pub fn created_at(&self) -> i64 {
        self.measurement.created_at
    }
}

/// Inputs the analysis endpoint needs besides the device id.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisRequest {
    pub height: f64,
    pub weight: f64,
    pub resistance: f64,
    pub age: u32,
    pub sex: Sex,
}

/// Where the next history page starts: the final record of the previous page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageCursor {
    /// Inclusive lower bound on `created_at`, epoch milliseconds.
    pub start_time: i64,
    pub last_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryPage {
    pub records: Vec<RawMeasurement>,
    pub has_more: Option<bool>,
}

/// The two read endpoints the sync pipeline needs.
#[async_trait]
pub trait ScaleApi: Send + Sync + 'static {
    async fn fetch_history_page(
        &self,
        device_id: &str,
        cursor: &PageCursor,
        page_size: u32,
    ) -> Result<HistoryPage, ScaleError>;

    /// `record_id` only labels logs; the vendor computes the report from `request`.
    async fn fetch_analysis_report(
        &self,
        device_id: &str,
        record_id: &str,
        request: &AnalysisRequest,
    ) -> Result<AnalysisReport, ScaleError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn measurement() -> RawMeasurement {
        RawMeasurement {
            record_id: "r1".into(),
            user_id: "u1".into(),
            nickname: Some("Sam".into()),
            device_id: "dev".into(),
            created_at: 1_700_000_000_000,
            weight: 78.3,
            height: 178.0,
            body_resistance: 0.0,
        }
    }

    #[test]
    fn vendor_codes_map_to_taxonomy() {
        assert!(matches!(
            ScaleError::from_vendor(1010, "token invalid"),
            ScaleError::TokenExpired(_)
        ));
        assert!(matches!(
            ScaleError::from_vendor(1004, "sign invalid"),
            ScaleError::InvalidCredentials(_)
        ));
        assert!(matches!(
            ScaleError::from_vendor(2006, "no device"),
            ScaleError::DeviceNotFound(_)
        ));
        assert_eq!(
            ScaleError::from_vendor(9999, "odd"),
            ScaleError::Unknown {
                code: 9999,
                msg: "odd".into()
            }
        );
    }

    #[test]
    fn http_status_mapping() {
        assert!(matches!(
            ScaleError::from_status(429, String::new()),
            ScaleError::RateLimited(_)
        ));
        assert!(matches!(
            ScaleError::from_status(503, String::new()),
            ScaleError::Transport(_)
        ));
        assert!(matches!(
            ScaleError::from_status(403, String::new()),
            ScaleError::InvalidCredentials(_)
        ));
    }

    #[test]
    fn sex_parses_codes_and_names() {
        assert_eq!("1".parse::<Sex>().unwrap(), Sex::Male);
        assert_eq!("Female".parse::<Sex>().unwrap(), Sex::Female);
        assert!("x".parse::<Sex>().is_err());
        assert_eq!(Sex::Female.vendor_code(), 2);
    }

    #[test]
    fn record_without_report_omits_the_field() {
        let rec = EnrichedRecord::without_report(measurement());
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["record_id"], "r1");
        assert_eq!(v["weight"], 78.3);
        assert!(v.get("analysis_report").is_none());
    }

    #[test]
    fn enriched_record_reads_back_flattened_form() {
        let payload = json!({
            "record_id": "r1", "user_id": "u1", "nickname": "Sam", "device_id": "dev",
            "created_at": 1_700_000_000_000i64, "weight": 78.3, "height": 178.0,
            "body_resistance": 0.0,
            "analysis_report": {"bmi": 24.7}
        });
        let rec: EnrichedRecord = serde_json::from_value(payload).expect("decode");
        assert_eq!(rec.measurement, measurement());
        assert_eq!(rec.analysis_report.unwrap().bmi, Some(24.7));
    }
}
