// src/model.rs

use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use time::{Date, OffsetDateTime};

/// Currencies we accept on a receipt. DKK is the reporting currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    DKK,
    USD,
    EUR,
    GBP,
    SEK,
    NOK,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::DKK => "DKK",
            Self::USD => "USD",
            Self::EUR => "EUR",
            Self::GBP => "GBP",
            Self::SEK => "SEK",
            Self::NOK => "NOK",
        };
        f.write_str(code)
    }
}

/// VAT (moms) classification the oracle assigns to a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VatCategory {
    #[serde(rename = "Standard (25%)")]
    Standard,
    #[serde(rename = "Reduced (0%)")]
    Reduced,
    Exempt,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagCategory {
    Compliance,
    Forex,
    Anomaly,
    #[serde(rename = "Data Integrity")]
    DataIntegrity,
}

/// Flag severities, ordered so High compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Final audit disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Pending,
    Green,
    Red,
    Review,
}

/// A Danish CVR number: exactly 8 ASCII digits.
///
/// Construction validates the shape, so any `Cvr` in the system is
/// well-formed. An oracle output with a malformed CVR fails deserialization
/// and aborts the audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cvr(String);

impl Cvr {
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(s.to_string()))
        } else {
            Err(AuditError::InvalidCvr(format!(
                "'{s}' is not exactly 8 digits"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Cvr {
    type Error = AuditError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Cvr> for String {
    fn from(cvr: Cvr) -> Self {
        cvr.0
    }
}

impl fmt::Display for Cvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One purchased item or service on a receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    #[serde(default = "default_quantity")]
    pub quantity: f64,
    pub unit_price: f64,
    /// Line total in the invoice currency, un-rounded.
    pub total_price: f64,
    /// The VAT fraction the oracle claims, e.g. 0.25 for 25%.
    pub vat_rate: f64,
    pub vat_category: VatCategory,
    /// Oracle confidence for this line, 0.0 to 1.0.
    pub ai_confidence: f64,
}

fn default_quantity() -> f64 {
    1.0
}

/// One issue found during reconciliation. Created only by the audit engine;
/// `is_resolved` is reserved for a future human-review workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditFlag {
    pub category: FlagCategory,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub is_resolved: bool,
}

/// The oracle's output contract: extracted fields without app metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub vendor_name: String,
    #[serde(default)]
    pub vendor_cvr: Option<Cvr>,
    pub invoice_date: Date,
    /// HH:MM:SS when printed on the receipt; used for duplicate detection.
    #[serde(default)]
    pub invoice_time: Option<String>,
    pub currency: Currency,
    /// True when line totals already contain VAT (most Danish receipts).
    pub prices_include_vat: bool,
    pub total_amount_raw: f64,
    pub total_vat_raw: f64,
    /// Rate into DKK as printed on the receipt, 1.0 when absent.
    #[serde(default = "default_exchange_rate")]
    pub exchange_rate: f64,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

fn default_exchange_rate() -> f64 {
    1.0
}

/// The master record produced by a completed audit. Owns its line items and
/// flags; read-only for callers once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub filename: String,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,

    pub vendor_name: String,
    pub vendor_cvr: Option<Cvr>,
    pub invoice_date: Date,
    pub invoice_time: Option<String>,
    pub currency: Currency,
    pub prices_include_vat: bool,
    pub total_amount_raw: f64,
    pub total_vat_raw: f64,

    /// Claimed total normalized into the reporting currency.
    pub total_amount_dkk: f64,
    pub exchange_rate_used: f64,

    pub line_items: Vec<LineItem>,
    /// Insertion order is significant: first-found issues surface first.
    pub audit_flags: Vec<AuditFlag>,

    pub status: Status,
    pub user_notes: Option<String>,
}

/// Deterministic invoice id from filename and upload instant.
pub fn generate_invoice_id(filename: &str, uploaded_at: OffsetDateTime) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update(uploaded_at.unix_timestamp_nanos().to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn cvr_accepts_exactly_eight_digits() {
        assert!(Cvr::parse("35954716").is_ok());
        assert!(Cvr::parse("1234567").is_err());
        assert!(Cvr::parse("123456789").is_err());
        assert!(Cvr::parse("1234567A").is_err());
        // Country prefixes are not stripped here; a prefixed id is malformed.
        assert!(Cvr::parse("DK12345678").is_err());
    }

    #[test]
    fn cvr_serde_round_trip_enforces_shape() {
        let cvr: Cvr = serde_json::from_str("\"47458714\"").unwrap();
        assert_eq!(cvr.as_str(), "47458714");
        assert!(serde_json::from_str::<Cvr>("\"47458\"").is_err());
    }

    #[test]
    fn flag_category_uses_display_names() {
        let json = serde_json::to_string(&FlagCategory::DataIntegrity).unwrap();
        assert_eq!(json, "\"Data Integrity\"");
    }

    #[test]
    fn severity_orders_high_greatest() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn invoice_id_is_deterministic() {
        let at = datetime!(2026-02-01 12:00:00 UTC);
        let a = generate_invoice_id("receipt.jpg", at);
        let b = generate_invoice_id("receipt.jpg", at);
        let c = generate_invoice_id("other.jpg", at);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
