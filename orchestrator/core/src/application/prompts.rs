// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Stage Prompts
//!
//! Handlebars templates for the three stages plus extraction of the JSON
//! plan the consolidator is asked to return.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Turn a `StrategyRequest` and prior stage output into prompts

use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;

use crate::domain::strategy::{Stage, StrategyRequest};

const STRATEGIST_SYSTEM: &str =
    "You are a rideshare strategy expert. Be concrete, local and brief.";
const BRIEFER_SYSTEM: &str =
    "You are a field briefer. You check a strategy against what is happening right now.";
const CONSOLIDATOR_SYSTEM: &str =
    "You are the final decision maker. You merge analysis into one actionable plan.";

const STRATEGIST_TEMPLATE: &str = r#"DRIVER CONTEXT:
- Location: {{locality}}
- GPS: {{latitude}}, {{longitude}}
- Time: {{time}}{{#if timezone}} ({{timezone}}){{/if}}
{{#if weather}}- Weather: {{weather}}
{{/if}}{{#if airport}}- Airport: {{airport}}
{{/if}}{{#if signal}}- Driver note: {{signal}}
{{/if}}
TASK:
Analyze current market conditions and recommend how to maximize earnings
over the next hour.

Include:
1. Market overview (demand patterns, surge likelihood)
2. Strategic insights (where demand is building and why)
3. Pro tips (specific actionable advice)
4. Earnings estimate (hourly potential)

Write 200-300 words."#;

const BRIEFER_TEMPLATE: &str = r#"STRATEGIC ANALYSIS:
{{strategy}}

DRIVER CONTEXT:
- Location: {{locality}}
- GPS: {{latitude}}, {{longitude}}
- Time: {{time}}{{#if timezone}} ({{timezone}}){{/if}}
{{#if weather}}- Weather: {{weather}}
{{/if}}{{#if airport}}- Airport: {{airport}}
{{/if}}
TASK:
Brief the driver on current conditions that confirm or contradict the
analysis above: events letting out, traffic, weather shifts, airport queues.
List each item with its expected effect on demand. Keep it under 150 words."#;

const CONSOLIDATOR_TEMPLATE: &str = r#"STRATEGIC ANALYSIS:
{{strategy}}

{{#if briefing}}CURRENT BRIEFING:
{{briefing}}
{{else}}CURRENT BRIEFING:
Unavailable. Rely on the strategic analysis alone and say so.
{{/if}}
DRIVER CONTEXT:
- Location: {{locality}}
- GPS: {{latitude}}, {{longitude}}
- Time: {{time}}{{#if timezone}} ({{timezone}}){{/if}}

TASK:
Produce the final recommendation: one short paragraph for the driver,
followed by a JSON plan in a ```json block:
{
  "staging_area": { "name": "string", "address": "string", "reasoning": "string" },
  "venues": [
    { "name": "string", "address": "string", "category": "string",
      "distance_miles": number, "drive_time_minutes": number, "reasoning": "string" }
  ]
}
Recommend 4-6 venues, 2-3 minutes apart, with a central staging area."#;

#[derive(Debug, Serialize)]
struct PromptContext<'a> {
    locality: &'a str,
    latitude: f64,
    longitude: f64,
    time: String,
    timezone: Option<&'a str>,
    weather: Option<String>,
    airport: Option<String>,
    signal: Option<&'a str>,
    strategy: Option<&'a str>,
    briefing: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    fn from_request(request: &'a StrategyRequest) -> Self {
        let snapshot = &request.snapshot;
        Self {
            locality: &snapshot.locality,
            latitude: snapshot.latitude,
            longitude: snapshot.longitude,
            time: snapshot.timestamp.to_rfc3339(),
            timezone: snapshot.timezone.as_deref(),
            weather: snapshot.weather.as_ref().map(describe),
            airport: snapshot.airport.as_ref().map(describe),
            signal: Some(request.signal.as_str()).filter(|s| !s.trim().is_empty()),
            strategy: None,
            briefing: None,
        }
    }
}

/// Strings are used as-is; anything else is rendered as compact JSON.
fn describe(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct PromptBuilder {
    handlebars: Handlebars<'static>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        // Prompts are plain text, not HTML.
        handlebars.register_escape_fn(handlebars::no_escape);

        handlebars
            .register_template_string(Stage::Strategist.as_str(), STRATEGIST_TEMPLATE)
            .context("Invalid strategist template")?;
        handlebars
            .register_template_string(Stage::Briefer.as_str(), BRIEFER_TEMPLATE)
            .context("Invalid briefer template")?;
        handlebars
            .register_template_string(Stage::Consolidator.as_str(), CONSOLIDATOR_TEMPLATE)
            .context("Invalid consolidator template")?;

        Ok(Self { handlebars })
    }

    /// Built-in system prompt for `stage`.
    pub fn system_prompt(stage: Stage) -> &'static str {
        match stage {
            Stage::Strategist => STRATEGIST_SYSTEM,
            Stage::Briefer => BRIEFER_SYSTEM,
            Stage::Consolidator => CONSOLIDATOR_SYSTEM,
        }
    }

    pub fn strategist(&self, request: &StrategyRequest) -> Result<String> {
        self.render(Stage::Strategist, &PromptContext::from_request(request))
    }

    pub fn briefer(&self, request: &StrategyRequest, strategy: &str) -> Result<String> {
        let context = PromptContext {
            strategy: Some(strategy),
            ..PromptContext::from_request(request)
        };
        self.render(Stage::Briefer, &context)
    }

    /// `briefing` is `None` when the briefer failed.
    pub fn consolidator(
        &self,
        request: &StrategyRequest,
        strategy: &str,
        briefing: Option<&str>,
    ) -> Result<String> {
        let context = PromptContext {
            strategy: Some(strategy),
            briefing,
            ..PromptContext::from_request(request)
        };
        self.render(Stage::Consolidator, &context)
    }

    fn render(&self, stage: Stage, context: &PromptContext<'_>) -> Result<String> {
        self.handlebars
            .render(stage.as_str(), context)
            .with_context(|| format!("Failed to render {stage} prompt"))
    }
}

/// Pull a JSON object out of model output.
///
/// Tries a ```json fence first, then any fenced block, then the outermost
/// `{...}` span. Only objects are accepted.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let parse = |candidate: &str| {
        serde_json::from_str::<serde_json::Value>(candidate.trim())
            .ok()
            .filter(|v| v.is_object())
    };

    for fence in ["```json", "```JSON", "```"] {
        if let Some(start) = text.find(fence) {
            let body = &text[start + fence.len()..];
            if let Some(end) = body.find("```") {
                if let Some(value) = parse(&body[..end]) {
                    return Some(value);
                }
            }
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    parse(&text[start..=end])
}
