// src/vat_rules.rs

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Reason attached to the fall-through default.
const DEFAULT_REASON: &str = "Standard Rate";

/// Reason attached to rules added through user feedback.
const USER_RULE_REASON: &str = "User Custom Rule";

/// One keyword rule. Keywords are stored upper-case; matching is substring
/// based, so the author must order overlapping keywords carefully — the
/// first match always wins and later overlaps are unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VatRule {
    pub keyword: String,
    pub vat_rate: f64,
    pub category: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultRule {
    pub vat_rate: f64,
    pub category: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RuleFile {
    rules: Vec<VatRule>,
    default_rule: DefaultRule,
}

/// Ordered, keyword-driven VAT lookup backed by a JSON file. The file is
/// read wholesale at construction and rewritten wholesale on every mutation;
/// concurrent writers are last-write-wins.
#[derive(Debug)]
pub struct VatRuleTable {
    path: PathBuf,
    rules: Vec<VatRule>,
    default_rule: DefaultRule,
}

impl VatRuleTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "VAT rule file missing — using built-in rules");
            let (rules, default_rule) = builtin_rules();
            return Ok(Self {
                path: path.to_path_buf(),
                rules,
                default_rule,
            });
        }

        let content = fs::read_to_string(path)?;
        let mut file: RuleFile = serde_json::from_str(&content)?;
        // Normalize so substring matching against upper-cased descriptions
        // works no matter how the file author cased the keywords.
        for rule in &mut file.rules {
            rule.keyword = rule.keyword.to_uppercase();
        }
        info!(path = %path.display(), rules = file.rules.len(), "VAT rules loaded");
        Ok(Self {
            path: path.to_path_buf(),
            rules: file.rules,
            default_rule: file.default_rule,
        })
    }

    /// Determine the legally expected VAT treatment of a line item.
    /// Returns `(rate, category, reason)`; falls through to the default
    /// when no keyword matches.
    pub fn lookup(&self, description: &str) -> (f64, String, String) {
        let desc_upper = description.to_uppercase();
        for rule in &self.rules {
            if desc_upper.contains(&rule.keyword) {
                return (rule.vat_rate, rule.category.clone(), rule.reason.clone());
            }
        }
        (
            self.default_rule.vat_rate,
            self.default_rule.category.clone(),
            DEFAULT_REASON.to_string(),
        )
    }

    /// User-feedback learning: append a new keyword rule and persist the
    /// table. Returns `Ok(false)` without touching anything when the keyword
    /// already exists.
    pub fn add_rule(&mut self, keyword: &str, vat_rate: f64, category: &str) -> Result<bool> {
        let keyword = keyword.to_uppercase();
        if self.rules.iter().any(|r| r.keyword == keyword) {
            info!(keyword = %keyword, "Rule already exists — skipping");
            return Ok(false);
        }

        self.rules.push(VatRule {
            keyword: keyword.clone(),
            vat_rate,
            category: category.to_string(),
            reason: USER_RULE_REASON.to_string(),
        });
        self.save()?;
        info!(keyword = %keyword, rate = vat_rate, "Custom VAT rule added");
        Ok(true)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = RuleFile {
            rules: self.rules.clone(),
            default_rule: self.default_rule.clone(),
        };
        fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

/// Shipped rule set covering the common Danish zero-rate cases.
fn builtin_rules() -> (Vec<VatRule>, DefaultRule) {
    let exempt = |keyword: &str, category: &str, reason: &str| VatRule {
        keyword: keyword.to_string(),
        vat_rate: 0.0,
        category: category.to_string(),
        reason: reason.to_string(),
    };
    (
        vec![
            exempt("PANT", "Exempt", "Danish Deposit (Pant) Exemption"),
            exempt("DEPOSIT", "Exempt", "Danish Deposit (Pant) Exemption"),
            exempt("AVIS", "Reduced (0%)", "Newspaper Zero Rate"),
        ],
        DefaultRule {
            vat_rate: 0.25,
            category: "Standard (25%)".to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_in(dir: &tempfile::TempDir) -> VatRuleTable {
        VatRuleTable::load(dir.path().join("vat_rules.json")).unwrap()
    }

    #[test]
    fn keyword_match_is_case_insensitive_substring() {
        let dir = tempfile::tempdir().unwrap();
        let table = table_in(&dir);

        let (rate, category, reason) = table.lookup("Coca Cola + pant A");
        assert_eq!(rate, 0.0);
        assert_eq!(category, "Exempt");
        assert_eq!(reason, "Danish Deposit (Pant) Exemption");
    }

    #[test]
    fn no_match_falls_through_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let table = table_in(&dir);

        let (rate, category, reason) = table.lookup("Arla Sødmælk");
        assert_eq!(rate, 0.25);
        assert_eq!(category, "Standard (25%)");
        assert_eq!(reason, "Standard Rate");
    }

    #[test]
    fn first_match_wins_on_overlapping_keywords() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vat_rules.json");
        fs::write(
            &path,
            r#"{
                "rules": [
                    { "keyword": "PANT A", "vat_rate": 0.0, "category": "Exempt", "reason": "narrow" },
                    { "keyword": "PANT", "vat_rate": 0.25, "category": "Standard (25%)", "reason": "broad" }
                ],
                "default_rule": { "vat_rate": 0.25, "category": "Standard (25%)" }
            }"#,
        )
        .unwrap();
        let table = VatRuleTable::load(&path).unwrap();

        let (rate, _, reason) = table.lookup("Cola Pant A retur");
        assert_eq!(rate, 0.0);
        assert_eq!(reason, "narrow");

        // The broad keyword still fires where the narrow one cannot.
        let (rate, _, reason) = table.lookup("Pant B");
        assert_eq!(rate, 0.25);
        assert_eq!(reason, "broad");
    }

    #[test]
    fn add_rule_persists_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vat_rules.json");
        let mut table = VatRuleTable::load(&path).unwrap();

        assert!(table.add_rule("taletidskort", 0.0, "Exempt").unwrap());
        let (rate, _, reason) = table.lookup("Lebara taletidskort 100kr");
        assert_eq!(rate, 0.0);
        assert_eq!(reason, "User Custom Rule");

        // Second add with the same keyword is a no-op.
        assert!(!table.add_rule("TALETIDSKORT", 0.25, "Standard (25%)").unwrap());
        let (rate, _, _) = table.lookup("taletidskort");
        assert_eq!(rate, 0.0);

        // The add survived a reload from disk.
        let reloaded = VatRuleTable::load(&path).unwrap();
        let (rate, _, reason) = reloaded.lookup("taletidskort");
        assert_eq!(rate, 0.0);
        assert_eq!(reason, "User Custom Rule");
    }
}
