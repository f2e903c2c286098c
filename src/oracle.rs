// src/oracle.rs

use crate::config::OracleConfig;
use crate::error::{AuditError, Result};
use crate::model::ExtractedDocument;
use crate::registry::CvrClient;
use crate::vat_rules::VatRuleTable;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

/// Instructions for the vision model: Danish receipt conventions plus the
/// exact output contract.
const SYSTEM_PROMPT: &str = r#"You are an expert financial auditor for Danish SMEs.
Your goal is to extract structured data from receipt and invoice images with maximum precision.

Context:
- You are auditing for Danish companies. Handle Danish number formatting ("1.250,00" means 1250.00).
- Look for "CVR", "SE-nr" or "VAT-nr" to find the vendor's CVR. It is always exactly 8 digits.
  Never take the customer's CVR by mistake, and never invent one — use null when absent.
- If the currency symbol is "kr." assume DKK.
- Extract every single line item. For each one, call the lookup_vat tool to determine the
  correct VAT rate and category. Use the receipt's own tax codes (e.g. "A" vs "B") as hints.
- Extract unit_price and total_price exactly as printed. Do NOT recalculate them.
- If a CVR number is visible, call the validate_cvr tool with it.

When you are done, return ONLY a JSON object matching this schema exactly:
{
  "vendor_name": "string",
  "vendor_cvr": "string of exactly 8 digits, or null",
  "invoice_date": "YYYY-MM-DD",
  "invoice_time": "HH:MM:SS or null",
  "currency": "DKK" | "USD" | "EUR" | "GBP" | "SEK" | "NOK",
  "prices_include_vat": boolean,
  "total_amount_raw": number,
  "total_vat_raw": number,
  "exchange_rate": number (1.0 unless printed on the receipt),
  "line_items": [
    {
      "description": "string",
      "quantity": number,
      "unit_price": number,
      "total_price": number,
      "vat_rate": number (e.g. 0.25),
      "vat_category": "Standard (25%)" | "Reduced (0%)" | "Exempt" | "Unknown",
      "ai_confidence": number (0.0 to 1.0)
    }
  ]
}

Return ONLY the JSON object, no markdown fences, no commentary."#;

/// Upper bound on assistant/tool round trips before we give up.
const MAX_TOOL_ROUNDS: usize = 8;

/// Read-only services the oracle may call mid-reasoning. The audit engine
/// re-validates everything afterwards regardless of what the oracle checked.
pub struct ToolDeps<'a> {
    pub rules: &'a VatRuleTable,
    pub registry: &'a mut CvrClient,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Value>,
    temperature: f64,
    tools: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolCall {
    id: String,
    #[serde(rename = "type", default = "function_call_type")]
    call_type: String,
    function: FunctionCall,
}

fn function_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    /// JSON-encoded argument object, as the wire protocol delivers it.
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct LookupVatArgs {
    item_description: String,
}

#[derive(Debug, Deserialize)]
struct ValidateCvrArgs {
    cvr_number: String,
}

fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "lookup_vat",
                "description": "Look up the correct Danish VAT rate and category for a line item description.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "item_description": {
                            "type": "string",
                            "description": "The product or service description from the receipt."
                        }
                    },
                    "required": ["item_description"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "validate_cvr",
                "description": "Validate a Danish CVR number against the business registry. Returns a JSON risk report.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "cvr_number": {
                            "type": "string",
                            "description": "The 8-digit Danish CVR number to validate."
                        }
                    },
                    "required": ["cvr_number"]
                }
            }
        }),
    ]
}

/// Send an image to the oracle and drive the tool loop until it produces a
/// structured document. Every failure here is fatal to the audit — there is
/// no fallback data source below the extraction step.
pub async fn extract_document(
    client: &Client,
    config: &OracleConfig,
    image_bytes: &[u8],
    mime: &str,
    deps: &mut ToolDeps<'_>,
) -> Result<ExtractedDocument> {
    let api_key = std::env::var("ORACLE_API_KEY")
        .map_err(|_| AuditError::Config("ORACLE_API_KEY env var required for extraction".into()))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(image_bytes);
    let data_url = format!("data:{mime};base64,{encoded}");

    let mut messages = vec![
        json!({"role": "system", "content": SYSTEM_PROMPT}),
        json!({"role": "user", "content": [
            {
                "type": "text",
                "text": "Audit this invoice image. Extract all fields, call lookup_vat for every line item, and validate_cvr if a CVR number is visible."
            },
            {"type": "image_url", "image_url": {"url": data_url}}
        ]}),
    ];

    let url = format!("{}/chat/completions", config.base_url);

    for round in 0..MAX_TOOL_ROUNDS {
        let request = ChatRequest {
            model: config.model.clone(),
            messages: messages.clone(),
            temperature: 0.0,
            tools: tool_definitions(),
        };

        let response = client
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&request)
            .send()
            .await
            .map_err(|e| AuditError::Extraction(format!("oracle request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuditError::Extraction(format!(
                "oracle API error {status}: {body}"
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AuditError::Extraction(format!("unreadable oracle response: {e}")))?;
        let AssistantMessage {
            content,
            tool_calls,
        } = chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| AuditError::Extraction("empty response from oracle".into()))?;

        if tool_calls.is_empty() {
            let content = content.as_deref().ok_or_else(|| {
                AuditError::Extraction("oracle returned neither content nor tool calls".into())
            })?;
            return parse_document(content);
        }

        info!(round, calls = tool_calls.len(), "Oracle requested tool calls");
        messages.push(json!({
            "role": "assistant",
            "content": content,
            "tool_calls": &tool_calls,
        }));
        for call in &tool_calls {
            let output = run_tool(call, deps).await;
            messages.push(json!({
                "role": "tool",
                "tool_call_id": call.id,
                "content": output,
            }));
        }
    }

    Err(AuditError::Extraction(format!(
        "oracle did not produce a document within {MAX_TOOL_ROUNDS} tool rounds"
    )))
}

/// Execute one tool call against the injected services. Bad arguments are
/// reported back to the model rather than failing the audit.
async fn run_tool(call: &ToolCall, deps: &mut ToolDeps<'_>) -> String {
    match call.function.name.as_str() {
        "lookup_vat" => match serde_json::from_str::<LookupVatArgs>(&call.function.arguments) {
            Ok(args) => {
                let (rate, category, reason) = deps.rules.lookup(&args.item_description);
                debug!(item = %args.item_description, rate, "lookup_vat tool call");
                format!(
                    "VAT rate: {}%, category: {category}, reason: {reason}",
                    rate * 100.0
                )
            }
            Err(e) => format!("Invalid arguments: {e}"),
        },
        "validate_cvr" => match serde_json::from_str::<ValidateCvrArgs>(&call.function.arguments) {
            Ok(args) => {
                let report = deps.registry.validate(&args.cvr_number).await;
                debug!(cvr = %args.cvr_number, valid = report.valid, "validate_cvr tool call");
                serde_json::to_string(&report)
                    .unwrap_or_else(|e| format!("Serialization error: {e}"))
            }
            Err(e) => format!("Invalid arguments: {e}"),
        },
        other => {
            warn!(tool = %other, "Oracle called an unknown tool");
            format!("Unknown tool: {other}")
        }
    }
}

/// Turn the final assistant content into a document, tolerating markdown
/// fences and leading reasoning text despite the prompt's instructions.
fn parse_document(content: &str) -> Result<ExtractedDocument> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let json_str = extract_json_object(trimmed)?;

    serde_json::from_str(json_str).map_err(|e| {
        AuditError::Extraction(format!("oracle output violates the document contract: {e}"))
    })
}

/// Slice the outermost JSON object from a string that may carry surrounding
/// text (e.g. thinking tokens).
fn extract_json_object(s: &str) -> Result<&str> {
    let start = s
        .find('{')
        .ok_or_else(|| AuditError::Extraction("no '{' found in oracle response".into()))?;
    let end = s
        .rfind('}')
        .ok_or_else(|| AuditError::Extraction("no '}' found in oracle response".into()))?;
    if end <= start {
        return Err(AuditError::Extraction(
            "malformed JSON in oracle response".into(),
        ));
    }
    Ok(&s[start..=end])
}
