//! Builds the provider task for one carrier execution.
//!
//! The prompt names the portal user but never the password; secrets
//! travel in [`TaskRequest::secrets`] only.

use std::collections::BTreeMap;
use std::fmt::Write;

use secrecy::SecretString;

use super::provider::TaskRequest;
use super::QuoteParams;
use crate::model::{ClientData, Recipe};

pub const PASSWORD_SECRET: &str = "password";
pub const MFA_SECRET: &str = "mfa_code";

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn push_section(
    lines: &mut Vec<String>,
    heading: &str,
    fields: &BTreeMap<String, serde_json::Value>,
) {
    if fields.is_empty() {
        return;
    }
    lines.push(String::new());
    lines.push(heading.to_string());
    for (key, value) in fields {
        lines.push(format!("- {}: {}", key, value_text(value)));
    }
}

fn push_client_data(lines: &mut Vec<String>, client: &ClientData) {
    lines.push(String::new());
    lines.push("CLIENT INFORMATION TO USE:".to_string());
    let personal = &client.personal;
    let labelled = [
        ("First Name", &personal.first_name),
        ("Last Name", &personal.last_name),
        ("Email", &personal.email),
        ("Phone", &personal.phone),
        ("Date of Birth", &personal.date_of_birth),
    ];
    for (label, value) in labelled {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            lines.push(format!("- {}: {}", label, value));
        }
    }

    push_section(lines, "PROPERTY INFORMATION:", &client.property);
    push_section(lines, "AUTO/VEHICLE INFORMATION:", &client.auto);

    if !client.drivers.is_empty() {
        lines.push(String::new());
        lines.push("DRIVER INFORMATION:".to_string());
        for (i, driver) in client.drivers.iter().enumerate() {
            lines.push(format!("  Driver {}:", i + 1));
            for (key, value) in driver {
                lines.push(format!("    - {}: {}", key, value_text(value)));
            }
        }
    }
}

fn push_recipe_hints(lines: &mut Vec<String>, recipe: &Recipe, client: &ClientData) {
    lines.push(String::new());
    lines.push(format!(
        "KNOWN WORKING PROCEDURE (recipe v{}), follow it unless the page differs:",
        recipe.version
    ));
    for (i, step) in recipe.steps.iter().enumerate() {
        let mut line = format!("{}. {}", i + 1, step);
        if let Some(value) = step.value_from.as_deref().and_then(|path| client.lookup(path)) {
            let _ = write!(line, " (value: {})", value);
        }
        lines.push(line);
    }

    if !recipe.field_mappings.is_empty() {
        lines.push(String::new());
        lines.push("FIELD MAPPING (client field -> portal field):".to_string());
        for (client_field, portal_field) in &recipe.field_mappings {
            lines.push(format!("- {} -> {}", client_field, portal_field));
        }
    }
}

/// Natural-language instructions for the provider.
pub fn build_task_prompt(params: &QuoteParams) -> String {
    let client = &params.client_data;
    let client_name = client
        .personal
        .full_name()
        .unwrap_or_else(|| "the insured".to_string());
    let portal = params
        .portal_url
        .as_deref()
        .unwrap_or("the carrier's agent portal");

    let mut lines = vec![
        format!(
            "You are filling out a {} insurance quote form on the {} portal.",
            params.quote_type,
            title_case(&params.carrier_code)
        ),
        String::new(),
        "IMPORTANT: Do not share or display credentials in any output.".to_string(),
        String::new(),
        "STEPS:".to_string(),
        format!("1. Navigate to {}", portal),
        format!(
            "2. Login with username '{}' and the password provided as the secret '{}'",
            params.credentials.username, PASSWORD_SECRET
        ),
        "3. Navigate to the new quote or get a quote section".to_string(),
        format!("4. Fill out the insurance quote form for client: {}", client_name),
    ];
    if params.credentials.mfa_code.is_some() {
        lines.push(format!(
            "   If asked for a verification code, use the secret '{}'",
            MFA_SECRET
        ));
    }

    push_client_data(&mut lines, client);

    if let Some(recipe) = &params.recipe {
        push_recipe_hints(&mut lines, recipe, client);
    }

    lines.extend(
        [
            "",
            "FINAL STEPS:",
            "5. Complete all required form pages",
            "6. Navigate through to the quote results page",
            "7. Extract and report the premium amount, coverages, and deductibles",
            "",
            "When you reach the quote results, report the following:",
            "- Annual premium amount",
            "- Monthly premium amount (if shown)",
            "- Coverage limits",
            "- Deductible amounts",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    if params.recipe.is_none() {
        lines.push(String::new());
        lines.push(
            "Also report each action you took (action, target selector, client field used)."
                .to_string(),
        );
    }

    lines.join("\n")
}

pub fn build_task_request(params: &QuoteParams) -> TaskRequest {
    let mut secrets: BTreeMap<String, SecretString> = BTreeMap::new();
    secrets.insert(PASSWORD_SECRET.to_string(), params.credentials.password.clone());
    if let Some(mfa) = &params.credentials.mfa_code {
        secrets.insert(MFA_SECRET.to_string(), mfa.clone());
    }

    let mut metadata = BTreeMap::new();
    metadata.insert("jobId".to_string(), params.job_id.clone());
    metadata.insert("carrierJobId".to_string(), params.carrier_job_id.clone());
    metadata.insert("carrier".to_string(), params.carrier_code.clone());
    if let Some(recipe) = &params.recipe {
        metadata.insert("recipeId".to_string(), recipe.id.clone());
    }

    TaskRequest {
        task: build_task_prompt(params),
        start_url: params.portal_url.clone(),
        browser_session_id: params.session.id.clone(),
        secrets,
        captcha_solution: params.captcha_solution.clone(),
        metadata,
    }
}
