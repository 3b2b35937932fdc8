//! Client for the MakerBot Reflector API.
//!
//! Reflector introduces remote connections: `call_printer` asks it to set
//! up a relay, and the returned relay address is then dialed like a local
//! printer (with an `auth_packet` call in place of token authentication).

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Production Reflector endpoint.
pub const DEFAULT_BASE_URL: &str = "https://reflector.makerbot.com";

/// HTTP client for MakerBot Reflector.
pub struct Client {
    base_url: String,
    access_token: String,
    http: reqwest::Client,
}

/// Response from [`Client::call_printer`].
#[derive(Debug, Clone, Deserialize)]
pub struct CallPrinterResponse {
    pub call: PrinterCall,
}

/// Relay coordinates for one printer call.
#[derive(Debug, Clone, Deserialize)]
pub struct PrinterCall {
    /// Identifier to echo back in the `auth_packet` RPC.
    pub id: String,
    /// Relay address as `host:port`.
    pub relay: String,
    /// Secret to echo back in the `auth_packet` RPC.
    pub client_code: String,
}

impl CallPrinterResponse {
    /// Split the relay address into host and port.
    pub fn relay_addr(&self) -> Result<(String, String)> {
        let relay = &self.call.relay;
        match relay.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !port.is_empty() => {
                Ok((host.to_string(), port.to_string()))
            }
            _ => Err(Error::InvalidRelay(relay.clone())),
        }
    }
}

impl Client {
    /// Reflector client for the production endpoint, authorized by a
    /// Thingiverse access token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self::with_base_url(access_token, DEFAULT_BASE_URL)
    }

    /// Reflector client against an arbitrary base URL (staging setups).
    pub fn with_base_url(access_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            access_token: access_token.into(),
            http: reqwest::Client::new(),
        }
    }

    /// List the printers connected to the Thingiverse account.
    pub async fn get_printers(&self) -> Result<Value> {
        self.get("/printers").await
    }

    /// Fetch one printer by id.
    pub async fn get_printer(&self, id: &str) -> Result<Value> {
        self.get(&format!("/printers/{id}")).await
    }

    /// Ask Reflector to set up a relay to the printer with `id`.
    pub async fn call_printer(&self, id: &str) -> Result<CallPrinterResponse> {
        let response = self
            .http
            .post(format!("{}/call", self.base_url))
            .bearer_auth(&self.access_token)
            .form(&[("printer_id", id)])
            .send()
            .await?;
        Ok(response.json().await?)
    }

    async fn get(&self, endpoint: &str) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}{endpoint}", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Ok(response.json().await?)
    }
}
