mod audit;
mod config;
mod error;
mod image;
mod model;
mod oracle;
mod registry;
mod vat_rules;

use config::Config;
use error::Result;
use registry::CvrClient;
use std::path::Path;
use vat_rules::VatRuleTable;

const CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cfg = Config::load(CONFIG_PATH)?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("audit") if args.len() >= 2 => cmd_audit(&cfg, &args[1..]).await,
        Some("add-rule") if args.len() == 4 => cmd_add_rule(&cfg, &args[1], &args[2], &args[3]),
        Some("check-cvr") if args.len() == 2 => cmd_check_cvr(&cfg, &args[1]).await,
        _ => {
            eprintln!("Usage:");
            eprintln!("  invoice_audit audit <image>...          audit one or more receipt images");
            eprintln!("  invoice_audit add-rule <keyword> <rate> <category>");
            eprintln!("  invoice_audit check-cvr <id>            validate a CVR number");
            Ok(())
        }
    }
}

/// Run the full pipeline per file. One failed file is reported and does not
/// stop the rest of the batch.
async fn cmd_audit(cfg: &Config, files: &[String]) -> Result<()> {
    let rules = VatRuleTable::load(&cfg.paths.vat_rules)?;
    let mut registry = CvrClient::new(&cfg.registry, &cfg.paths.cvr_cache)?;
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(cfg.oracle.timeout_secs))
        .build()?;

    for file in files {
        match audit::run_audit(Path::new(file), cfg, &client, &rules, &mut registry).await {
            Ok(invoice) => println!("{}", serde_json::to_string_pretty(&invoice)?),
            Err(e) => tracing::error!(file = %file, error = %e, "Audit failed"),
        }
    }
    Ok(())
}

/// User-feedback learning: teach the rule table a new keyword.
fn cmd_add_rule(cfg: &Config, keyword: &str, rate: &str, category: &str) -> Result<()> {
    let rate: f64 = rate
        .parse()
        .map_err(|_| error::AuditError::Config(format!("'{rate}' is not a valid VAT rate")))?;

    let mut rules = VatRuleTable::load(&cfg.paths.vat_rules)?;
    if rules.add_rule(keyword, rate, category)? {
        println!("Added rule: {} -> {}% ({category})", keyword.to_uppercase(), rate * 100.0);
    } else {
        println!("Rule for '{}' already exists — unchanged.", keyword.to_uppercase());
    }
    Ok(())
}

async fn cmd_check_cvr(cfg: &Config, id: &str) -> Result<()> {
    let mut registry = CvrClient::new(&cfg.registry, &cfg.paths.cvr_cache)?;
    let report = registry.validate(id).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
