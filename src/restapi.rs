//! Control-plane HTTP client.
//!
//! OAuth2 client-credentials login, job registration (returning the
//! per-job monitoring settings) and node registration. All calls happen
//! once per run before the engine starts; the steady-state core never
//! touches the network besides the database.

use std::time::Duration;

use log::{debug, error};
use serde::Deserialize;
use serde_json::Value;

use crate::config::RestApiConfig;
use crate::error::RestError;

const MODULE: &str = "RestApi";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-job settings handed out at registration time.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSettings {
    /// Sampling interval in seconds.
    pub interval: u64,
    pub enable_monitoring: bool,
    pub enable_likwid: bool,
    pub benchmark_required: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

pub struct ControlPlaneClient {
    http: reqwest::blocking::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: Option<String>,
}

impl ControlPlaneClient {
    pub fn new(config: &RestApiConfig) -> Result<Self, RestError> {
        // the control plane typically runs with a self-signed certificate
        // inside the cluster
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            http,
            base_url: format!("https://{}:{}", config.host, config.port),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token: None,
        })
    }

    pub fn login(&mut self) -> Result<(), RestError> {
        let response: TokenResponse = self
            .http
            .post(format!("{}/oauth/token", self.base_url))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()?
            .error_for_status()?
            .json()?;

        match response.access_token {
            Some(token) => {
                self.token = Some(token);
                Ok(())
            }
            None => Err(RestError::Login),
        }
    }

    /// Tokens expire on their own after a few minutes; revocation failures
    /// are only logged.
    pub fn logout(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let result = self
            .http
            .post(format!("{}/oauth/revoke", self.base_url))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("token", token.as_str()),
                ("token_type_hint", "access_token"),
            ])
            .send();
        if let Err(e) = result {
            error!(target: MODULE, "failed to revoke access token - {e}");
        }
    }

    /// Register this node for the job and fetch the job settings.
    pub fn register_job(
        &self,
        job_id: u32,
        hostname: &str,
        hash: &str,
    ) -> Result<JobSettings, RestError> {
        let endpoint = format!("/api/v1/jobs/{job_id}/register");
        let body = serde_json::json!({ "hostname": hostname, "hash": hash });
        let response = self.post_json(&endpoint, &body)?;

        serde_json::from_value(response).map_err(|e| RestError::Response {
            endpoint,
            message: e.to_string(),
        })
    }

    /// Upload the node's system inventory (including benchmark results)
    /// under its configuration hash.
    pub fn register_node(&self, hash: &str, info: &Value) -> Result<(), RestError> {
        let endpoint = format!("/api/v1/nodes/{hash}/register");
        self.post_json(&endpoint, info)?;
        Ok(())
    }

    fn post_json(&self, endpoint: &str, body: &Value) -> Result<Value, RestError> {
        debug!(target: MODULE, "POST {endpoint}");
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, endpoint))
            .json(body);

        request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request.basic_auth(&self.client_id, Some(&self.client_secret)),
        };

        Ok(request.send()?.error_for_status()?.json()?)
    }
}
