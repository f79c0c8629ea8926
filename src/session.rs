use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, ClientBuilder};
use url::Url;

/// Wrapper around the shared HTTP client and the local relay location.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
    relay_base: Url,
}

/// Minimal data required to build an HTTP session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_base: String,
    pub connect_timeout: Duration,
}

impl SessionConfig {
    pub fn new(relay_base: String, connect_timeout: Duration) -> Self {
        Self {
            relay_base,
            connect_timeout,
        }
    }
}

impl HttpSession {
    /// Build a new HTTP session. The timeout only bounds connection setup;
    /// streamed responses stay open as long as the model keeps talking.
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;

        let relay_base = Url::parse(&config.relay_base)
            .with_context(|| format!("parsing relay base URL `{}`", config.relay_base))?;

        Ok(Self { client, relay_base })
    }

    /// Returns reference to the inner `reqwest::Client`.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Base URL of the local relay used by the relay-routed model families.
    pub fn relay_base(&self) -> &Url {
        &self.relay_base
    }
}
