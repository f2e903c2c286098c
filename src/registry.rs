// src/registry.rs

use crate::config::RegistryConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

/// Sent with every registry request; cvrapi.dk requires a descriptive agent.
const USER_AGENT: &str = "invoice-audit/0.1 (Danish invoice compliance check)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
    Unknown,
}

/// The closed verdict type returned for every validation, no matter how the
/// lookup went. `warning` is only set when stale cached data was served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub valid: bool,
    pub risk_level: RiskLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub last_checked: OffsetDateTime,
    pub report: RiskReport,
}

/// CVR registry client with an on-disk verdict cache.
///
/// Cache entries are overwritten in place and never evicted; freshness is a
/// TTL check at read time. The file is rewritten wholesale after every live
/// fetch — concurrent audits race last-write-wins, which costs at most one
/// extra lookup later.
#[derive(Debug)]
pub struct CvrClient {
    http: reqwest::Client,
    base_url: String,
    cache_days: i64,
    cache_path: PathBuf,
    cache: HashMap<String, CacheEntry>,
}

impl CvrClient {
    pub fn new(config: &RegistryConfig, cache_path: impl AsRef<Path>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        let cache_path = cache_path.as_ref().to_path_buf();
        let cache = load_cache(&cache_path);
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            cache_days: config.cache_days,
            cache_path,
            cache,
        })
    }

    /// Validate a CVR identifier, preferring the cache, degrading to stale
    /// data or an Unknown verdict when the registry is unreachable. Never
    /// fails: a broken registry must not abort an audit.
    pub async fn validate(&mut self, raw_id: &str) -> RiskReport {
        let id = normalize_id(raw_id);

        if let Some(entry) = self.cache.get(&id) {
            if OffsetDateTime::now_utc() - entry.last_checked < Duration::days(self.cache_days) {
                info!(cvr = %id, "Registry verdict served from cache");
                return entry.report.clone();
            }
        }

        match self.fetch_live(&id).await {
            Ok(Some(report)) => {
                self.cache.insert(
                    id.clone(),
                    CacheEntry {
                        last_checked: OffsetDateTime::now_utc(),
                        report: report.clone(),
                    },
                );
                if let Err(e) = self.save_cache() {
                    warn!(error = %e, "Failed to persist CVR cache");
                }
                info!(cvr = %id, valid = report.valid, risk = ?report.risk_level, "Registry verdict fetched");
                report
            }
            // 404: a valid negative result. Not cached, so a transient
            // registry gap cannot poison later audits.
            Ok(None) => RiskReport {
                valid: false,
                risk_level: RiskLevel::High,
                message: "CVR number not found in registry.".to_string(),
                company_name: None,
                warning: None,
            },
            Err(e) => {
                if let Some(entry) = self.cache.get(&id) {
                    warn!(cvr = %id, error = %e, "Registry unreachable — serving stale cache");
                    let mut report = entry.report.clone();
                    report.warning = Some(format!(
                        "Offline mode: cached registry data may be older than {} days.",
                        self.cache_days
                    ));
                    report
                } else {
                    warn!(cvr = %id, error = %e, "Registry unreachable and no cached verdict");
                    RiskReport {
                        valid: false,
                        risk_level: RiskLevel::Unknown,
                        message: format!("Registry error: {e}"),
                        company_name: None,
                        warning: None,
                    }
                }
            }
        }
    }

    /// `Ok(Some)` on 200, `Ok(None)` on 404, `Err` on anything else.
    async fn fetch_live(&self, id: &str) -> Result<Option<RiskReport>> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[("search", id), ("country", "dk")])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let payload: serde_json::Value = response.error_for_status()?.json().await?;
        Ok(Some(classify_risk(&payload)))
    }

    fn save_cache(&self) -> Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.cache_path, serde_json::to_string_pretty(&self.cache)?)?;
        Ok(())
    }
}

fn load_cache(path: &Path) -> HashMap<String, CacheEntry> {
    if !path.exists() {
        return HashMap::new();
    }
    match fs::read_to_string(path).map_err(|e| e.to_string()).and_then(|content| {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    }) {
        Ok(cache) => cache,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable CVR cache — starting empty");
            HashMap::new()
        }
    }
}

/// Strip whitespace and a leading DK country prefix from a raw identifier.
fn normalize_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = match trimmed.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("dk") => &trimmed[2..],
        _ => trimmed,
    };
    stripped.trim().to_string()
}

/// Translate the raw registry payload into a business risk verdict.
///
/// A dissolution end-date wins outright; otherwise the whole serialized
/// payload is scanned for the Danish bankruptcy and forced-dissolution
/// tokens, since the registry spreads status text across varying fields.
pub fn classify_risk(payload: &serde_json::Value) -> RiskReport {
    let company_name = payload
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    if let Some(enddate) = payload.get("enddate").filter(|v| !v.is_null()) {
        let shown = enddate
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| enddate.to_string());
        return RiskReport {
            valid: false,
            risk_level: RiskLevel::High,
            message: format!("Company dissolved (ophørt) on {shown}."),
            company_name,
            warning: None,
        };
    }

    let dump = payload.to_string().to_lowercase();
    if dump.contains("konkurs") {
        return RiskReport {
            valid: false,
            risk_level: RiskLevel::Critical,
            message: "Company is bankrupt (under konkurs).".to_string(),
            company_name,
            warning: None,
        };
    }
    if dump.contains("tvangsopløsning") {
        return RiskReport {
            valid: false,
            risk_level: RiskLevel::Critical,
            message: "Company is under forced dissolution (tvangsopløsning).".to_string(),
            company_name,
            warning: None,
        };
    }

    RiskReport {
        valid: true,
        risk_level: RiskLevel::Low,
        message: "Company is active and valid.".to_string(),
        company_name,
        warning: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A port nothing listens on, so live fetches fail fast.
    const DEAD_URL: &str = "http://127.0.0.1:9";

    fn config(base_url: &str) -> RegistryConfig {
        RegistryConfig {
            base_url: base_url.to_string(),
            cache_days: 7,
            timeout_secs: 1,
        }
    }

    fn low_risk_report(name: &str) -> RiskReport {
        RiskReport {
            valid: true,
            risk_level: RiskLevel::Low,
            message: "Company is active and valid.".to_string(),
            company_name: Some(name.to_string()),
            warning: None,
        }
    }

    fn write_cache(path: &Path, id: &str, age: Duration, report: &RiskReport) {
        let mut cache = HashMap::new();
        cache.insert(
            id.to_string(),
            CacheEntry {
                last_checked: OffsetDateTime::now_utc() - age,
                report: report.clone(),
            },
        );
        fs::write(path, serde_json::to_string_pretty(&cache).unwrap()).unwrap();
    }

    #[test]
    fn normalization_strips_whitespace_and_dk_prefix() {
        assert_eq!(normalize_id("  DK35954716 "), "35954716");
        assert_eq!(normalize_id("dk 47458714"), "47458714");
        assert_eq!(normalize_id("35954716"), "35954716");
    }

    #[test]
    fn active_company_classifies_low_risk() {
        let report = classify_risk(&json!({"name": "Lego System A/S", "industrycode": 323242}));
        assert!(report.valid);
        assert_eq!(report.risk_level, RiskLevel::Low);
        assert_eq!(report.company_name.as_deref(), Some("Lego System A/S"));
    }

    #[test]
    fn enddate_short_circuits_to_dissolved() {
        // Even with a bankruptcy token elsewhere, the end-date verdict wins.
        let report = classify_risk(&json!({
            "name": "Gone ApS",
            "enddate": "2024-03-01",
            "status": "under konkurs"
        }));
        assert!(!report.valid);
        assert_eq!(report.risk_level, RiskLevel::High);
        assert!(report.message.contains("2024-03-01"));
    }

    #[test]
    fn bankruptcy_token_classifies_critical() {
        let report = classify_risk(&json!({"name": "Risky ApS", "status": "UNDER KONKURS"}));
        assert!(!report.valid);
        assert_eq!(report.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn forced_dissolution_token_classifies_critical() {
        let report =
            classify_risk(&json!({"name": "Tvang ApS", "creditbankrupt": "tvangsopløsning"}));
        assert!(!report.valid);
        assert_eq!(report.risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn fresh_cache_hit_skips_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cvr_cache.json");
        let report = low_risk_report("Netto A/S");
        write_cache(&cache_path, "35954716", Duration::hours(1), &report);

        // The dead endpoint proves no network call is attempted.
        let mut client = CvrClient::new(&config(DEAD_URL), &cache_path).unwrap();
        let got = client.validate("DK35954716").await;
        assert_eq!(got, report);
    }

    #[tokio::test]
    async fn stale_cache_plus_dead_registry_degrades_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cvr_cache.json");
        let report = low_risk_report("Netto A/S");
        write_cache(&cache_path, "35954716", Duration::days(30), &report);

        let mut client = CvrClient::new(&config(DEAD_URL), &cache_path).unwrap();
        let got = client.validate("35954716").await;

        // Same verdict as cached, plus a non-empty staleness warning.
        assert_eq!(got.valid, report.valid);
        assert_eq!(got.risk_level, report.risk_level);
        assert_eq!(got.message, report.message);
        assert!(got.warning.is_some_and(|w| !w.is_empty()));
    }

    #[tokio::test]
    async fn dead_registry_without_cache_yields_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cvr_cache.json");

        let mut client = CvrClient::new(&config(DEAD_URL), &cache_path).unwrap();
        let got = client.validate("35954716").await;
        assert!(!got.valid);
        assert_eq!(got.risk_level, RiskLevel::Unknown);
        assert!(got.message.contains("Registry error"));
    }

    #[test]
    fn cache_file_round_trips_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cvr_cache.json");
        let report = low_risk_report("Føtex A/S");
        write_cache(&cache_path, "12345678", Duration::minutes(5), &report);

        let loaded = load_cache(&cache_path);
        assert_eq!(loaded["12345678"].report, report);
    }

    #[test]
    fn corrupt_cache_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cvr_cache.json");
        fs::write(&cache_path, "not json at all").unwrap();
        assert!(load_cache(&cache_path).is_empty());
    }
}
