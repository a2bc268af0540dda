use crate::{ScaleError, Sex};
use crate::enrich::SubjectProfile;
use crate::http_client::ClientOptions;
use crate::retry::RetryPolicy;
use crate::sync::SyncOptions;
use crate::utils::parse_birthdate;
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const MAX_PAGE_SIZE: u32 = 100;

/// Tuya data centres.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    China,
    WesternAmerica,
    EasternAmerica,
    CentralEurope,
    WesternEurope,
    India,
}

impl Region {
    pub fn endpoint(self) -> &'static str {
        match self {
            Region::China => "https://openapi.tuyacn.com",
            Region::WesternAmerica => "https://openapi.tuyaus.com",
            Region::EasternAmerica => "https://openapi-ueaz.tuyaus.com",
            Region::CentralEurope => "https://openapi.tuyaeu.com",
            Region::WesternEurope => "https://openapi-weaz.tuyaeu.com",
            Region::India => "https://openapi.tuyain.com",
        }
    }
}

impl FromStr for Region {
    type Err = ScaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cn" => Ok(Region::China),
            "us" => Ok(Region::WesternAmerica),
            "us-e" => Ok(Region::EasternAmerica),
            "eu" => Ok(Region::CentralEurope),
            "eu-w" => Ok(Region::WesternEurope),
            "in" => Ok(Region::India),
            other => Err(ScaleError::Config(format!("TUYA_REGION: unknown region {other:?}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub access_id: String,
    pub access_key: SecretString,
    pub device_id: String,
    pub region: Region,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub credentials: Credentials,
    /// Overrides the region host when set.
    pub base_url: Option<String>,
    pub subject: SubjectProfile,
    pub data_file: PathBuf,
    pub page_size: u32,
    pub retry: RetryPolicy,
    pub enrich_concurrency: usize,
    pub request_timeout: Duration,
    /// Repeat the sync on this period; `None` runs once.
    pub sync_interval: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Result<Self, ScaleError> {
        Self::from_env_with(|k| std::env::var(k).ok())
    }

    /// Testable helper that reads configuration values using the provided
    /// function, so tests never touch the process environment.
    pub fn from_env_with<F>(mut get: F) -> Result<Self, ScaleError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |k: &str| get(k).filter(|v| !v.trim().is_empty());
        let required = |v: Option<String>, k: &str| {
            v.ok_or_else(|| ScaleError::Config(format!("{k} missing")))
        };

        let access_id = required(get("TUYA_ACCESS_ID"), "TUYA_ACCESS_ID")?;
        let access_key = required(get("TUYA_ACCESS_KEY"), "TUYA_ACCESS_KEY")?;
        let device_id = required(get("TUYA_DEVICE_ID"), "TUYA_DEVICE_ID")?;
        let region = get("TUYA_REGION")
            .as_deref()
            .unwrap_or("eu")
            .parse::<Region>()?;

        let birthdate_raw = required(get("TUYA_BIRTHDATE"), "TUYA_BIRTHDATE")?;
        let birthdate = parse_birthdate(&birthdate_raw).ok_or_else(|| {
            ScaleError::Config(format!("TUYA_BIRTHDATE: expected YYYY-MM-DD, got {birthdate_raw:?}"))
        })?;
        let sex = match get("TUYA_SEX") {
            Some(v) => v
                .parse::<Sex>()
                .map_err(|_| ScaleError::Config(format!("TUYA_SEX: unknown value {v:?}")))?,
            None => Sex::Male,
        };

        let page_size: u32 = parse_or(get("TUYA_PAGE_SIZE"), "TUYA_PAGE_SIZE", MAX_PAGE_SIZE)?;
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ScaleError::Config(format!(
                "TUYA_PAGE_SIZE must be within 1..={MAX_PAGE_SIZE}, got {page_size}"
            )));
        }
        let enrich_concurrency: usize =
            parse_or(get("TUYA_ENRICH_CONCURRENCY"), "TUYA_ENRICH_CONCURRENCY", 4)?;
        if enrich_concurrency == 0 {
            return Err(ScaleError::Config(
                "TUYA_ENRICH_CONCURRENCY must be at least 1".into(),
            ));
        }
        let retry = RetryPolicy {
            max_retries: parse_or(get("TUYA_MAX_RETRIES"), "TUYA_MAX_RETRIES", 3)?,
            ..RetryPolicy::default()
        };
        let timeout_secs: u64 = parse_or(
            get("TUYA_REQUEST_TIMEOUT_SECS"),
            "TUYA_REQUEST_TIMEOUT_SECS",
            10,
        )?;
        let sync_interval = get("TUYA_SYNC_INTERVAL_SECS")
            .map(|v| parse_value::<u64>(&v, "TUYA_SYNC_INTERVAL_SECS"))
            .transpose()?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            credentials: Credentials {
                access_id,
                access_key: SecretString::new(access_key.into()),
                device_id,
                region,
            },
            base_url: get("TUYA_BASE_URL"),
            subject: SubjectProfile {
                birthdate,
                sex,
                user_id: get("TUYA_USER_ID"),
            },
            data_file: get("TUYA_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("scale_data.json")),
            page_size,
            retry,
            enrich_concurrency,
            request_timeout: Duration::from_secs(timeout_secs.max(1)),
            sync_interval,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.credentials.region.endpoint())
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            device_id: self.credentials.device_id.clone(),
            page_size: self.page_size,
            subject: self.subject.clone(),
            enrich_concurrency: self.enrich_concurrency,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            timeout: self.request_timeout,
            retry: self.retry.clone(),
            ..ClientOptions::default()
        }
    }
}

fn parse_value<T: FromStr>(raw: &str, key: &str) -> Result<T, ScaleError> {
    raw.trim()
        .parse()
        .map_err(|_| ScaleError::Config(format!("{key}: invalid value {raw:?}")))
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T, ScaleError> {
    raw.map_or(Ok(default), |v| parse_value(&v, key))
}
