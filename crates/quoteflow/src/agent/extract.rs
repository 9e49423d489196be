//! Turns provider output into [`QuoteResultData`].
//!
//! Structured output is preferred; free text from the agent's final
//! summary fills whatever the structure leaves out.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;

use crate::model::QuoteResultData;

const MAX_RAW_OUTPUT_CHARS: usize = 2000;

static RE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d[\d.,\s]*").unwrap());

static RE_ANNUAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)annual(?:\s+premium)?[:\s]*\$?\s*(\d[\d,]*(?:\.\d+)?)",
        r"(?i)yearly(?:\s+premium)?[:\s]*\$?\s*(\d[\d,]*(?:\.\d+)?)",
        r"(?i)per\s+year[:\s]*\$?\s*(\d[\d,]*(?:\.\d+)?)",
        r"(?i)\$?(\d[\d,]*(?:\.\d+)?)\s*(?:per\s+|/\s*)?(?:year|yr\b|annually)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static RE_MONTHLY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)monthly(?:\s+premium)?[:\s]*\$?\s*(\d[\d,]*(?:\.\d+)?)",
        r"(?i)per\s+month[:\s]*\$?\s*(\d[\d,]*(?:\.\d+)?)",
        r"(?i)\$?(\d[\d,]*(?:\.\d+)?)\s*(?:per\s+|/\s*)?(?:month|mo\b)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const ANNUAL_KEYS: &[&str] = &[
    "premium",
    "annualPremium",
    "premiumAnnual",
    "premium_annual",
    "annual_premium",
];
const MONTHLY_KEYS: &[&str] = &[
    "premiumMonthly",
    "monthlyPremium",
    "premium_monthly",
    "monthly_premium",
];

/// Parses an amount out of currency-formatted text.
///
/// Accepts `$1,234.56`, `1.234,56 €`, `USD 980` and plain numbers. When
/// both separators appear, the later one is the decimal mark; a lone comma
/// followed by one or two digits is a decimal comma.
pub fn parse_currency(text: &str) -> Option<f64> {
    let token = RE_NUMBER.find(text)?.as_str();
    let token: String = token
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .trim_end_matches(['.', ','])
        .to_string();

    let last_dot = token.rfind('.');
    let last_comma = token.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) if comma > dot => token.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => token.replace(',', ""),
        (None, Some(comma)) => {
            let decimals = token.len() - comma - 1;
            if token.matches(',').count() == 1 && (1..=2).contains(&decimals) {
                token.replace(',', ".")
            } else {
                token.replace(',', "")
            }
        }
        (Some(_), None) if token.matches('.').count() > 1 => token.replace('.', ""),
        _ => token,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Reads an amount from a JSON number or currency string.
pub fn amount_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_currency(s),
        _ => None,
    }
}

fn first_match(patterns: &[Regex], text: &str) -> Option<f64> {
    patterns.iter().find_map(|re| {
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok())
    })
}

pub fn scan_annual_premium(text: &str) -> Option<f64> {
    first_match(&RE_ANNUAL, text)
}

pub fn scan_monthly_premium(text: &str) -> Option<f64> {
    first_match(&RE_MONTHLY, text)
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

fn lookup_amount(object: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|k| object.get(*k))
        .find_map(amount_from_value)
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Builds quote data from a finished task's structured and text output.
/// Missing pieces stay empty; this never fails.
pub fn extract_quote(structured: Option<&Value>, text: Option<&str>) -> QuoteResultData {
    let object = structured.and_then(Value::as_object);
    let text = text.unwrap_or_default();

    let premium = object
        .and_then(|o| lookup_amount(o, ANNUAL_KEYS))
        .or_else(|| scan_annual_premium(text));
    let premium_monthly = object
        .and_then(|o| lookup_amount(o, MONTHLY_KEYS))
        .or_else(|| scan_monthly_premium(text))
        .or_else(|| premium.map(|annual| round_cents(annual / 12.0)));

    let raw = if !text.is_empty() {
        Some(text.to_string())
    } else {
        structured.map(|v| v.to_string())
    };

    QuoteResultData {
        premium,
        premium_monthly,
        coverages: string_map(object.and_then(|o| o.get("coverages"))),
        deductibles: string_map(object.and_then(|o| o.get("deductibles"))),
        raw_output: raw.map(|r| truncate_chars(&r, MAX_RAW_OUTPUT_CHARS)),
        extracted_at: Some(Utc::now()),
    }
}
