//! Runtime configuration, read from the environment once at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::StaticTokenVerifier;
use crate::error::ConfigError;
use crate::orchestrator::ReportFailurePolicy;
use crate::report::ReportSettings;

const DEFAULT_ORIGINS: &str =
    "http://localhost:3000,http://127.0.0.1:3000,http://localhost:5173,http://127.0.0.1:5173";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub classifier_model: PathBuf,
    pub detector_model: PathBuf,
    pub upload_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub database_url: String,
    pub report: ReportSettings,
    pub report_failure: ReportFailurePolicy,
    pub max_concurrent_predictions: usize,
    pub max_upload_bytes: usize,
    pub tokens: StaticTokenVerifier,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let max_concurrent_predictions: usize =
            parse(&lookup, "XVISION_MAX_CONCURRENT_PREDICTIONS", 8)?;
        if max_concurrent_predictions == 0 {
            return Err(ConfigError::Invalid {
                key: "XVISION_MAX_CONCURRENT_PREDICTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let report_failure = match lookup("XVISION_REPORT_FAILURE").as_deref() {
            None | Some("fail") => ReportFailurePolicy::Fail,
            Some("omit") => ReportFailurePolicy::Omit,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "XVISION_REPORT_FAILURE",
                    value: other.to_string(),
                    reason: "expected `fail` or `omit`".into(),
                })
            }
        };

        let allowed_origins: Vec<String> = get("XVISION_ALLOWED_ORIGINS", DEFAULT_ORIGINS)
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_owned)
            .collect();
        // Credentialed CORS needs explicit origins.
        if allowed_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::Invalid {
                key: "XVISION_ALLOWED_ORIGINS",
                value: "*".into(),
                reason: "list explicit origins instead of a wildcard".into(),
            });
        }

        Ok(Self {
            bind_addr: get("XVISION_BIND_ADDR", "127.0.0.1:8080"),
            classifier_model: get("XVISION_CLASSIFIER_MODEL", "models/fracture_classifier.onnx")
                .into(),
            detector_model: get("XVISION_DETECTOR_MODEL", "models/fracture_detector.onnx").into(),
            upload_dir: get("XVISION_UPLOAD_DIR", "uploads").into(),
            temp_dir: get("XVISION_TEMP_DIR", "temp").into(),
            database_url: get("XVISION_DATABASE_URL", "sqlite://xvision.db"),
            report: ReportSettings {
                api_base: get("XVISION_REPORT_API_BASE", "https://api.groq.com/openai/v1"),
                api_key: lookup("XVISION_REPORT_API_KEY").or_else(|| lookup("GROQ_API_KEY")),
                model: get("XVISION_REPORT_MODEL", "llama3-70b-8192"),
                timeout: Duration::from_secs(parse(&lookup, "XVISION_REPORT_TIMEOUT_SECS", 60)?),
            },
            report_failure,
            max_concurrent_predictions,
            max_upload_bytes: parse(&lookup, "XVISION_MAX_UPLOAD_BYTES", 20 * 1024 * 1024)?,
            tokens: StaticTokenVerifier::parse(&get("XVISION_API_TOKENS", ""))?,
            allowed_origins,
        })
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
