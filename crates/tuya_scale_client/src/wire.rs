//! Vendor JSON shapes and their conversion into the crate's types.
//!
//! Everything that comes off the wire is decoded here. Missing required fields
//! and values of the wrong type become `ScaleError::Decode`; unknown fields are
//! ignored.

use crate::{AnalysisReport, AnalysisRequest, HistoryPage, RawMeasurement, ScaleError};
use chrono::{DateTime, Duration, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};

const BODY_SNIPPET: usize = 256;
const MAX_TOKEN_LIFETIME_SECS: i64 = 30 * 24 * 3600;

#[derive(Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
}

/// Decode `{success, result, code, msg}` and then `result` into `T`.
pub(crate) fn decode_envelope<T: DeserializeOwned>(body: &str) -> Result<T, ScaleError> {
    let envelope: Envelope = serde_json::from_str(body).map_err(|e| decode_error(&e, body))?;
    if !envelope.success {
        return Err(ScaleError::from_vendor(
            envelope.code.unwrap_or_default(),
            envelope.msg.unwrap_or_default(),
        ));
    }
    let result = envelope
        .result
        .ok_or_else(|| ScaleError::Decode("successful envelope without result".into()))?;
    serde_json::from_value(result).map_err(|e| decode_error(&e, body))
}

fn decode_error(err: &serde_json::Error, body: &str) -> ScaleError {
    let snippet: String = body.chars().take(BODY_SNIPPET).collect();
    ScaleError::Decode(format!("{err} - body: {snippet}"))
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResult {
    access_token: String,
    /// Seconds.
    expire_time: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenResult {
    pub(crate) fn into_parts(self, now: DateTime<Utc>) -> (String, Option<String>, DateTime<Utc>) {
        let expires_at = now + Duration::seconds(self.expire_time.clamp(0, MAX_TOKEN_LIFETIME_SECS));
        let refresh = self.refresh_token.filter(|t| !t.is_empty());
        (self.access_token, refresh, expires_at)
    }
}

#[derive(Debug, Deserialize)]
struct VendorRecord {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    user_id: Option<String>,
    #[serde(default)]
    nick_name: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    device_id: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    create_time: i64,
    /// The vendor's spelling. `weight` is read too in case it is ever fixed;
    /// when both are present the vendor spelling wins.
    #[serde(default, deserialize_with = "opt_lenient_f64")]
    wegith: Option<f64>,
    #[serde(default, deserialize_with = "opt_lenient_f64")]
    weight: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    height: f64,
    #[serde(default, deserialize_with = "opt_lenient_f64")]
    body_r: Option<f64>,
}

impl VendorRecord {
    fn into_measurement(self, device_id: &str) -> Result<RawMeasurement, ScaleError> {
        let weight = self.wegith.or(self.weight).ok_or_else(|| {
            ScaleError::Decode(format!("record {}: missing field `wegith`", self.id))
        })?;
        Ok(RawMeasurement {
            record_id: self.id,
            user_id: self.user_id.unwrap_or_default(),
            nickname: self.nick_name.or(self.nickname),
            device_id: self
                .device_id
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| device_id.to_string()),
            created_at: self.create_time,
            weight,
            height: self.height,
            body_resistance: self.body_r.unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryResult {
    records: Vec<VendorRecord>,
    #[serde(default)]
    has_more: Option<bool>,
}

impl HistoryResult {
    pub(crate) fn into_page(self, device_id: &str) -> Result<HistoryPage, ScaleError> {
        Ok(HistoryPage {
            records: self
                .records
                .into_iter()
                .map(|r| r.into_measurement(device_id))
                .collect::<Result<_, _>>()?,
            has_more: self.has_more,
        })
    }
}

/// JSON body of the analysis-report call.
#[derive(Debug, Serialize)]
pub(crate) struct AnalysisBody {
    height: f64,
    weight: f64,
    age: u32,
    sex: u8,
    resistance: String,
}

impl From<&AnalysisRequest> for AnalysisBody {
    fn from(req: &AnalysisRequest) -> Self {
        Self {
            height: req.height,
            weight: req.weight,
            age: req.age,
            sex: req.sex.vendor_code(),
            // 718.0 renders as "718", which is what the scale reports.
            resistance: req.resistance.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct VendorReport {
    #[serde(deserialize_with = "opt_lenient_f64")]
    bmi: Option<f64>,
    #[serde(deserialize_with = "opt_lenient_f64")]
    fat: Option<f64>,
    #[serde(deserialize_with = "opt_lenient_f64")]
    muscle: Option<f64>,
    #[serde(deserialize_with = "opt_lenient_f64")]
    water: Option<f64>,
    #[serde(deserialize_with = "opt_lenient_f64")]
    bones: Option<f64>,
    #[serde(deserialize_with = "opt_lenient_f64")]
    visceral_fat: Option<f64>,
    #[serde(deserialize_with = "opt_lenient_f64")]
    protein: Option<f64>,
    #[serde(deserialize_with = "opt_lenient_f64")]
    ffm: Option<f64>,
    #[serde(deserialize_with = "opt_lenient_f64")]
    metabolism: Option<f64>,
    #[serde(deserialize_with = "opt_lenient_f64")]
    body_age: Option<f64>,
    #[serde(deserialize_with = "opt_lenient_f64")]
    body_score: Option<f64>,
    #[serde(deserialize_with = "opt_string_or_number")]
    body_type: Option<String>,
}

impl TryFrom<VendorReport> for AnalysisReport {
    type Error = ScaleError;

    fn try_from(v: VendorReport) -> Result<Self, Self::Error> {
        let report = AnalysisReport {
            bmi: v.bmi,
            body_fat_pct: v.fat,
            muscle_mass: v.muscle,
            body_water_pct: v.water,
            bone_mass: v.bones,
            visceral_fat: v.visceral_fat,
            protein: v.protein,
            fat_free_mass: v.ffm,
            metabolism: v.metabolism,
            body_age: v.body_age,
            body_score: v.body_score,
            body_type: v.body_type,
        };
        if report == AnalysisReport::default() {
            return Err(ScaleError::Decode("analysis report has no known fields".into()));
        }
        Ok(report)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    opt_string_or_number(deserializer)?.ok_or_else(|| D::Error::custom("expected string or number, got null"))
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    let parsed = match value {
        None => return Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| D::Error::custom(format!("number out of range: {n}")))?,
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| D::Error::custom(format!("expected numeric string, got {s:?}")))?,
        Some(other) => return Err(D::Error::custom(format!("expected number, got {other}"))),
    };
    // JSON has no NaN or infinity, so these could never be persisted.
    if !parsed.is_finite() {
        return Err(D::Error::custom(format!("expected finite number, got {parsed}")));
    }
    Ok(Some(parsed))
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    opt_lenient_f64(deserializer)?.ok_or_else(|| D::Error::custom("expected number, got null"))
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let parsed = match &value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| D::Error::custom(format!("expected integer, got {value}")))
}
