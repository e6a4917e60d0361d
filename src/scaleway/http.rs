//! Raw HTTP access to the Scaleway Instance API.
//!
//! `scaleway-rs` covers servers and images but not volumes, snapshots, or
//! image registration, so those calls go through a shared `reqwest` client.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ScalewayBackend, ScalewayBackendError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub(super) const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Identifies a call for error reporting.
#[derive(Clone, Copy, Debug)]
pub(super) struct ApiCall<'a> {
    pub(super) operation: &'static str,
    pub(super) kind: &'static str,
    pub(super) resource: &'a str,
    pub(super) zone: &'a str,
}

/// Maps a response status and body onto the backend error kinds.
pub(super) fn check_status(
    call: ApiCall<'_>,
    status: StatusCode,
    body: &[u8],
) -> Result<(), ScalewayBackendError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ScalewayBackendError::NotFound {
            kind: call.kind,
            id: call.resource.to_owned(),
            zone: call.zone.to_owned(),
        });
    }
    Err(ScalewayBackendError::Api {
        operation: call.operation,
        resource: call.resource.to_owned(),
        status: status.as_u16(),
        message: String::from_utf8_lossy(body).trim().to_owned(),
    })
}

impl ScalewayBackend {
    pub(super) fn zone_url(zone: &str, path: &str) -> String {
        format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{zone}/{path}")
    }

    pub(super) fn get(url: &str) -> RequestBuilder {
        HTTP_CLIENT.get(url)
    }

    pub(super) fn post(url: &str) -> RequestBuilder {
        HTTP_CLIENT.post(url)
    }

    pub(super) fn patch(url: &str) -> RequestBuilder {
        HTTP_CLIENT.patch(url)
    }

    pub(super) fn delete(url: &str) -> RequestBuilder {
        HTTP_CLIENT.delete(url)
    }

    /// Sends an authenticated request and returns the raw body on success.
    pub(super) async fn send(
        &self,
        request: RequestBuilder,
        call: ApiCall<'_>,
    ) -> Result<Vec<u8>, ScalewayBackendError> {
        let response = request
            .header("X-Auth-Token", &self.config.secret_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        debug!(
            operation = call.operation,
            resource = call.resource,
            status = status.as_u16(),
            "scaleway api call"
        );
        check_status(call, status, &body)?;
        Ok(body)
    }

    /// Sends an authenticated request and decodes the JSON body.
    pub(super) async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        call: ApiCall<'_>,
    ) -> Result<T, ScalewayBackendError> {
        let body = self.send(request, call).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
