//! Bearer token management with single-flight refresh.

use crate::types::{RefreshRequest, RefreshResponse};
use crate::{Result, TransportError};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// Holds the device credentials and the current access token.
///
/// Concurrent requests that all hit a 401 funnel through one refresh: the
/// refresh mutex serializes them, and every waiter re-checks whether the
/// token already rotated before firing its own refresh request.
pub struct TokenManager {
    device_id: String,
    access_token: RwLock<String>,
    refresh_token: RwLock<String>,
    refresh_gate: Mutex<()>,
}

impl TokenManager {
    /// Create a manager from the stored device credentials.
    #[must_use]
    pub fn new(device_id: &str, access_token: &str, refresh_token: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            access_token: RwLock::new(access_token.to_string()),
            refresh_token: RwLock::new(refresh_token.to_string()),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Device identifier.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current access token.
    #[must_use]
    pub fn access_token(&self) -> String {
        self.access_token.read().clone()
    }

    /// Whether credentials are present at all.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.device_id.is_empty() && !self.refresh_token.read().is_empty()
    }

    /// Exchange the refresh token for a fresh access token.
    ///
    /// `stale_token` is the access token the caller saw rejected; when the
    /// stored token already differs, another task refreshed first and this
    /// call returns without touching the network.
    pub async fn refresh(
        &self,
        http: &reqwest::Client,
        base_url: &Url,
        stale_token: &str,
    ) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;

        if *self.access_token.read() != stale_token {
            debug!("token already rotated by a concurrent refresh");
            return Ok(());
        }

        let url = base_url
            .join("api/v1/sync/devices/refresh")
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let body = RefreshRequest {
            refresh_token: self.refresh_token.read().clone(),
            device_id: self.device_id.clone(),
        };

        let response = http.post(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "token refresh rejected");
            return Err(TransportError::Auth(format!(
                "refresh rejected with {status}: {message}"
            )));
        }

        let rotated: RefreshResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(format!("refresh response: {e}")))?;

        *self.access_token.write() = rotated.access_token;
        *self.refresh_token.write() = rotated.refresh_token;
        debug!(expires_at = %rotated.access_expires_at, "access token rotated");
        Ok(())
    }
}
