use serde_json::{json, Value};
use url::Url;

use crate::dialect::{self, Dialect};
use crate::error::{CompareError, Result};
use crate::profile::ModelProfile;

pub const DEFAULT_API_VERSION: &str = "2023-12-01-preview";
const DIRECT_MAX_TOKENS: u32 = 2000;
const RELAY_MAX_TOKENS: u32 = 1000;
const RELAY_TEMPERATURE: f64 = 0.7;
const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// How the response body must be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// One JSON document carrying the complete answer.
    SingleJson,
    /// `data:`-framed event-stream lines carrying increments.
    EventStream,
}

/// A fully resolved outbound request for one model invocation.
#[derive(Debug, Clone)]
pub struct RequestPlan {
    pub dialect: Dialect,
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
    pub mode: ResponseMode,
}

/// Resolve a profile and prompt into a concrete request.
///
/// Pure: validates the profile, picks the dialect, and renders URL, headers,
/// and body without touching the network. Incomplete profiles fail here,
/// before anything is sent.
pub fn build_plan(relay_base: &Url, profile: &ModelProfile, prompt: &str) -> Result<RequestPlan> {
    profile.validate()?;

    let dialect = dialect::classify(profile);
    let plan = match dialect {
        Dialect::Standard => RequestPlan {
            dialect,
            url: deployment_url(profile)?,
            headers: vec![("api-key", profile.api_key.clone())],
            body: json!({
                "messages": user_messages(prompt),
                "max_tokens": DIRECT_MAX_TOKENS,
                "stream": true,
            }),
            mode: ResponseMode::EventStream,
        },
        Dialect::Reasoning => RequestPlan {
            dialect,
            url: deployment_url(profile)?,
            headers: vec![("api-key", profile.api_key.clone())],
            body: json!({
                "messages": user_messages(prompt),
                "max_completion_tokens": DIRECT_MAX_TOKENS,
                "stream": false,
            }),
            mode: ResponseMode::SingleJson,
        },
        Dialect::PhiRelay => RequestPlan {
            dialect,
            url: relay_url(relay_base, "api/phi")?,
            headers: Vec::new(),
            body: relay_body(profile, prompt, false),
            mode: ResponseMode::SingleJson,
        },
        Dialect::DeepseekRelay => RequestPlan {
            dialect,
            url: relay_url(relay_base, "api/deepseek")?,
            headers: Vec::new(),
            body: relay_body(profile, prompt, true),
            mode: ResponseMode::EventStream,
        },
    };
    Ok(plan)
}

fn deployment_url(profile: &ModelProfile) -> Result<Url> {
    let api_version = profile
        .api_version
        .as_deref()
        .filter(|version| !version.trim().is_empty())
        .unwrap_or(DEFAULT_API_VERSION);
    let raw = format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        profile.endpoint.trim_end_matches('/'),
        profile.deployment_id,
        api_version
    );
    Url::parse(&raw).map_err(|err| {
        CompareError::Configuration(format!("invalid endpoint for model `{}`: {err}", profile.id))
    })
}

fn relay_url(relay_base: &Url, path: &str) -> Result<Url> {
    relay_base
        .join(path)
        .map_err(|err| CompareError::Configuration(format!("invalid relay base URL: {err}")))
}

fn user_messages(prompt: &str) -> Value {
    json!([{ "role": "user", "content": prompt }])
}

/// Relay requests carry the upstream coordinates in the body; the relay
/// itself holds no credentials.
fn relay_body(profile: &ModelProfile, prompt: &str, stream: bool) -> Value {
    json!({
        "apiKey": profile.api_key,
        "endpoint": profile.endpoint,
        "deploymentId": profile.deployment_id,
        "model": profile.deployment_id,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": prompt },
        ],
        "max_tokens": RELAY_MAX_TOKENS,
        "temperature": RELAY_TEMPERATURE,
        "stream": stream,
    })
}
