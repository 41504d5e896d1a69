use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::{AgentError, GatewayError};
use crate::gateway::{Gateway, GatewayRequest};

pub(crate) const SESSION_CREATE: &str = "/v1/session/create";
pub(crate) const SESSION_CLOSE: &str = "/v1/session/close";

/// Lazily creates and caches the helper session.
///
/// The lock is held across the create call, so concurrent callers share one
/// request instead of racing to create several sessions.
pub(crate) struct SessionManager {
    gateway: Arc<dyn Gateway>,
    session: Mutex<Option<String>>,
}

impl SessionManager {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            session: Mutex::new(None),
        }
    }

    /// Returns the cached session id without creating one.
    pub async fn current(&self) -> Option<String> {
        self.session.lock().await.clone()
    }

    pub async fn ensure_session(&self) -> Result<String, AgentError> {
        let mut slot = self.session.lock().await;
        if let Some(id) = slot.as_ref() {
            return Ok(id.clone());
        }

        let data = self
            .gateway
            .send(GatewayRequest::post(SESSION_CREATE, json!({ "mode": "agent" })))
            .await?;
        if data.get("status").and_then(Value::as_str) != Some("success") {
            return Err(AgentError::SessionCreation {
                code: field(&data, "error").unwrap_or("session_creation_failed").to_string(),
                message: field(&data, "message")
                    .unwrap_or("Failed to create session")
                    .to_string(),
            });
        }
        let Some(id) = field(&data, "session_id") else {
            return Err(GatewayError::InvalidResponse {
                path: SESSION_CREATE.to_string(),
            }
            .into());
        };
        info!(session_id = id, "session created");
        *slot = Some(id.to_string());
        Ok(id.to_string())
    }

    /// Closes the session on the server (best effort) and forgets it.
    pub async fn close(&self) {
        let Some(id) = self.session.lock().await.take() else {
            return;
        };
        match self
            .gateway
            .send(GatewayRequest::post(SESSION_CLOSE, json!({ "session_id": id })))
            .await
        {
            Ok(_) => info!(session_id = %id, "session closed"),
            Err(err) => warn!(session_id = %id, error = %err, "failed to close session"),
        }
    }
}

fn field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}
