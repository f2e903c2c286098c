// src/audit.rs

use crate::config::Config;
use crate::error::Result;
use crate::image;
use crate::model::{
    AuditFlag, Currency, ExtractedDocument, FlagCategory, Invoice, Severity, Status,
    generate_invoice_id,
};
use crate::oracle::{self, ToolDeps};
use crate::registry::{CvrClient, RiskLevel};
use crate::vat_rules::VatRuleTable;
use std::path::Path;
use time::OffsetDateTime;
use tracing::info;

/// Slack allowed between the recomputed VAT sum and the claimed total, in
/// currency units. Covers per-line rounding to øre. The boundary is
/// exclusive: a difference of exactly this much passes.
const VAT_TOLERANCE: f64 = 0.05;

/// Ordered flag accumulator threaded through the reconciliation steps.
/// The single factory for flags; insertion order is the display order.
#[derive(Debug, Default)]
pub struct FlagSink {
    flags: Vec<AuditFlag>,
}

impl FlagSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, category: FlagCategory, severity: Severity, message: impl Into<String>) {
        self.flags.push(AuditFlag {
            category,
            severity,
            message: message.into(),
            is_resolved: false,
        });
    }

    pub fn into_flags(self) -> Vec<AuditFlag> {
        self.flags
    }
}

/// The VAT contained in a line total, depending on whether the total is
/// tax-inclusive (extract the component) or tax-exclusive (add on top).
pub fn vat_component(total_price: f64, vat_rate: f64, prices_include_vat: bool) -> f64 {
    if prices_include_vat {
        total_price * vat_rate / (1.0 + vat_rate)
    } else {
        total_price * vat_rate
    }
}

/// Step 1: check every line item's claimed rate against the rule table.
/// The comparison is strict, no tolerance. Flags only, never overwrites.
pub fn verify_vat_lines(doc: &ExtractedDocument, rules: &VatRuleTable, sink: &mut FlagSink) {
    for item in &doc.line_items {
        let (rule_rate, _, reason) = rules.lookup(&item.description);
        if item.vat_rate != rule_rate {
            sink.push(
                FlagCategory::DataIntegrity,
                Severity::Medium,
                format!(
                    "VAT mismatch on '{}': extractor saw {}%, but rule '{}' expects {}%.",
                    item.description,
                    item.vat_rate * 100.0,
                    reason,
                    rule_rate * 100.0
                ),
            );
        }
    }
}

/// Step 2: recompute the total VAT from the line items and compare against
/// the claimed figure, within the rounding tolerance.
pub fn verify_vat_total(doc: &ExtractedDocument, sink: &mut FlagSink) {
    let calculated: f64 = doc
        .line_items
        .iter()
        .map(|item| vat_component(item.total_price, item.vat_rate, doc.prices_include_vat))
        .sum();

    if (calculated - doc.total_vat_raw).abs() > VAT_TOLERANCE {
        sink.push(
            FlagCategory::DataIntegrity,
            Severity::High,
            format!(
                "VAT arithmetic error: line items sum to {calculated:.2}, but the invoice claims {:.2}.",
                doc.total_vat_raw
            ),
        );
    }
}

/// Map a registry risk level onto a flag severity. Critical collapses to
/// High, which drives the invoice Red; Unknown (registry unreachable,
/// nothing cached) maps to Medium and lands the invoice in Review.
pub fn severity_for(risk: RiskLevel) -> Severity {
    match risk {
        RiskLevel::Low => Severity::Low,
        RiskLevel::Medium | RiskLevel::Unknown => Severity::Medium,
        RiskLevel::High | RiskLevel::Critical => Severity::High,
    }
}

/// Step 3: vendor compliance. A missing CVR is itself an audit signal and
/// costs no network call; a present CVR is validated against the registry.
pub async fn verify_compliance(
    doc: &ExtractedDocument,
    registry: &mut CvrClient,
    sink: &mut FlagSink,
) {
    let Some(ref cvr) = doc.vendor_cvr else {
        sink.push(
            FlagCategory::Compliance,
            Severity::Medium,
            "No CVR number found on the receipt.",
        );
        return;
    };

    let report = registry.validate(cvr.as_str()).await;
    if !report.valid {
        sink.push(
            FlagCategory::Compliance,
            severity_for(report.risk_level),
            format!("CVR alert for {cvr}: {}", report.message),
        );
    }
}

/// Step 4: normalize the claimed total into DKK. Identity for DKK invoices;
/// anything else converts at the extracted rate and leaves a Forex note.
pub fn normalize_currency(doc: &ExtractedDocument, sink: &mut FlagSink) -> f64 {
    if doc.currency == Currency::DKK {
        return doc.total_amount_raw;
    }
    let converted = doc.total_amount_raw * doc.exchange_rate;
    sink.push(
        FlagCategory::Forex,
        Severity::Low,
        format!(
            "Converted {:.2} {} to {converted:.2} DKK (rate {}).",
            doc.total_amount_raw, doc.currency, doc.exchange_rate
        ),
    );
    converted
}

/// Step 5: no flags is Green, any High flag is Red, the rest is Review.
pub fn assign_status(flags: &[AuditFlag]) -> Status {
    if flags.is_empty() {
        Status::Green
    } else if flags.iter().any(|f| f.severity == Severity::High) {
        Status::Red
    } else {
        Status::Review
    }
}

/// Re-validate an extracted document independently of whatever the oracle
/// claims to have checked, and assemble the final invoice record.
pub async fn reconcile(
    doc: ExtractedDocument,
    filename: &str,
    rules: &VatRuleTable,
    registry: &mut CvrClient,
) -> Invoice {
    let uploaded_at = OffsetDateTime::now_utc();
    let id = generate_invoice_id(filename, uploaded_at);
    let mut sink = FlagSink::new();

    verify_vat_lines(&doc, rules, &mut sink);
    verify_vat_total(&doc, &mut sink);
    verify_compliance(&doc, registry, &mut sink).await;
    let total_amount_dkk = normalize_currency(&doc, &mut sink);

    let audit_flags = sink.into_flags();
    let status = assign_status(&audit_flags);

    Invoice {
        id,
        filename: filename.to_string(),
        uploaded_at,
        vendor_name: doc.vendor_name,
        vendor_cvr: doc.vendor_cvr,
        invoice_date: doc.invoice_date,
        invoice_time: doc.invoice_time,
        currency: doc.currency,
        prices_include_vat: doc.prices_include_vat,
        total_amount_raw: doc.total_amount_raw,
        total_vat_raw: doc.total_vat_raw,
        total_amount_dkk,
        exchange_rate_used: doc.exchange_rate,
        line_items: doc.line_items,
        audit_flags,
        status,
        user_notes: None,
    }
}

/// Full pipeline for one upload: read, gate, extract, reconcile.
///
/// Image and extraction failures abort the audit with no partial invoice;
/// registry degradation surfaces as a compliance flag instead.
pub async fn run_audit(
    path: &Path,
    config: &Config,
    client: &reqwest::Client,
    rules: &VatRuleTable,
    registry: &mut CvrClient,
) -> Result<Invoice> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();
    let span = tracing::info_span!("audit", file = %filename);
    let _guard = span.enter();

    let bytes = std::fs::read(path)?;
    let mime = image::prepare_image(&bytes)?;

    let mut deps = ToolDeps { rules, registry };
    let doc = oracle::extract_document(client, &config.oracle, &bytes, mime, &mut deps).await?;
    info!(
        vendor = %doc.vendor_name,
        cvr = ?doc.vendor_cvr,
        line_items = doc.line_items.len(),
        total = doc.total_amount_raw,
        currency = %doc.currency,
        "Oracle extraction complete"
    );

    let invoice = reconcile(doc, &filename, rules, registry).await;
    info!(
        id = %invoice.id,
        status = ?invoice.status,
        flags = invoice.audit_flags.len(),
        "Audit complete"
    );
    Ok(invoice)
}
