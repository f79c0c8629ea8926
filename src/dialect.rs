use crate::profile::ModelProfile;

/// Request and response shape families for the supported providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Direct chat-completions deployment answering as an event stream.
    Standard,
    /// Reasoning family: same URL shape, single JSON response, no streaming.
    Reasoning,
    /// Phi family, routed through the local relay, forced non-streaming.
    PhiRelay,
    /// DeepSeek family, routed through the local relay, streaming.
    DeepseekRelay,
}

impl Dialect {
    pub fn label(self) -> &'static str {
        match self {
            Dialect::Standard => "standard",
            Dialect::Reasoning => "reasoning",
            Dialect::PhiRelay => "phi-relay",
            Dialect::DeepseekRelay => "deepseek-relay",
        }
    }
}

/// Classify a profile into its dialect.
///
/// Explicit hints on the profile win. Otherwise the deployment id, display
/// name, and endpoint are scanned case-insensitively for known provider
/// tokens; the reasoning token is only matched against deployment id and
/// name. Anything unrecognized is `Standard`.
pub fn classify(profile: &ModelProfile) -> Dialect {
    if profile.is_phi_model {
        return Dialect::PhiRelay;
    }
    if profile.is_deepseek_model {
        return Dialect::DeepseekRelay;
    }

    let deployment = profile.deployment_id.to_lowercase();
    let name = profile.name.to_lowercase();
    let endpoint = profile.endpoint.to_lowercase();

    if deployment.contains("o1") || name.contains("o1") {
        Dialect::Reasoning
    } else if [&deployment, &name, &endpoint]
        .iter()
        .any(|haystack| haystack.contains("phi"))
    {
        Dialect::PhiRelay
    } else if [&deployment, &name, &endpoint]
        .iter()
        .any(|haystack| haystack.contains("deepseek"))
    {
        Dialect::DeepseekRelay
    } else {
        Dialect::Standard
    }
}
