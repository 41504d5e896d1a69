use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

use crate::client::AgentClient;
use crate::errors::AgentError;
use crate::gateway::GatewayRequest;
use crate::result::{RawOrigin, RunResult};

const UI_DUMP: &str = "/v1/tools/ui_dump";
const SCREENSHOT: &str = "/v1/tools/screenshot";
const FEEDBACK: &str = "/v1/feedback";

/// Direct device actions, outside of any agent task.
impl AgentClient {
    pub async fn home(&self) -> RunResult {
        self.tool("home", Map::new()).await
    }

    pub async fn back(&self) -> RunResult {
        self.tool("back", Map::new()).await
    }

    pub async fn tap(&self, x: i32, y: i32) -> RunResult {
        self.tool("tap", object(json!({ "x": x, "y": y }))).await
    }

    pub async fn swipe(
        &self,
        start: (i32, i32),
        end: (i32, i32),
        duration_ms: u32,
    ) -> RunResult {
        if duration_ms == 0 {
            return AgentError::invalid("swipe duration_ms must be greater than 0").into();
        }
        let body = json!({
            "start_x": start.0,
            "start_y": start.1,
            "end_x": end.0,
            "end_y": end.1,
            "duration_ms": duration_ms,
        });
        self.tool("swipe", object(body)).await
    }

    pub async fn input_text(&self, text: &str) -> RunResult {
        if text.is_empty() {
            return AgentError::invalid("input_text requires a non-empty string").into();
        }
        self.tool("input_text", object(json!({ "text": text }))).await
    }

    /// Sends an Android keycode (e.g. 66 for enter).
    pub async fn press_key(&self, keycode: i32) -> RunResult {
        self.tool("press_key", object(json!({ "keycode": keycode }))).await
    }

    pub async fn start_app(&self, package: &str, activity: Option<&str>) -> RunResult {
        if package.trim().is_empty() {
            return AgentError::invalid("start_app requires a package name").into();
        }
        let mut body = object(json!({ "package": package }));
        if let Some(activity) = activity {
            body.insert("activity".into(), activity.into());
        }
        self.tool("start_app", body).await
    }

    /// Asks the device side to wait `ms` milliseconds.
    pub async fn delay(&self, ms: u64) -> RunResult {
        if ms == 0 {
            return AgentError::invalid("delay requires ms greater than 0").into();
        }
        self.tool("delay", object(json!({ "ms": ms }))).await
    }

    async fn tool(&self, name: &str, mut body: Map<String, Value>) -> RunResult {
        let session_id = match self.ensure_session().await {
            Ok(id) => id,
            Err(err) => return err.into(),
        };
        info!(tool = name, session_id = %session_id, "device tool");
        body.insert("session_id".into(), session_id.into());
        let request = GatewayRequest::post(format!("/v1/tools/{name}"), Value::Object(body));
        match self.inner.gateway.send(request).await {
            Ok(data) => tool_result(name, data),
            Err(err) => {
                error!(tool = name, error = %err, "device tool failed");
                AgentError::from(err).into()
            }
        }
    }

    /// Current UI hierarchy dump, optionally written to `save_to`.
    pub async fn ui_tree(&self, save_to: Option<&Path>) -> Result<String, AgentError> {
        let data = self.tool_data(UI_DUMP, "ui_tree_failed").await?;
        let dump = data
            .get("data")
            .and_then(|d| d.get("ui_dump"))
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::Tool {
                code: "ui_tree_failed".into(),
                message: "Missing UI dump data in response".into(),
            })?
            .to_string();
        if let Some(path) = save_to {
            tokio::fs::write(path, &dump).await?;
            info!(path = %path.display(), "UI tree saved");
        }
        Ok(dump)
    }

    /// PNG screenshot of the device screen.
    ///
    /// Also written to `screenshot_path` from the config (best effort) and to
    /// `save_to` when given.
    pub async fn screenshot(&self, save_to: Option<&Path>) -> Result<Vec<u8>, AgentError> {
        let data = self.tool_data(SCREENSHOT, "screenshot_failed").await?;
        let encoded = data
            .get("data")
            .and_then(|d| d.get("screenshot_base64"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AgentError::Tool {
                code: "screenshot_failed".into(),
                message: "Missing screenshot data in response".into(),
            })?;
        let png = B64.decode(encoded).map_err(|e| AgentError::Tool {
            code: "screenshot_failed".into(),
            message: format!("Invalid base64 screenshot data: {e}"),
        })?;
        if let Some(path) = &self.inner.config.screenshot_path
            && let Err(err) = tokio::fs::write(path, &png).await
        {
            warn!(path = %path.display(), error = %err, "failed to save screenshot");
        }
        if let Some(path) = save_to {
            tokio::fs::write(path, &png).await?;
            info!(path = %path.display(), "screenshot saved");
        }
        Ok(png)
    }

    async fn tool_data(&self, path: &str, default_code: &str) -> Result<Value, AgentError> {
        let session_id = self.ensure_session().await?;
        let data = self
            .inner
            .gateway
            .send(GatewayRequest::get(path, json!({ "session_id": session_id })))
            .await?;
        if data.get("status").and_then(Value::as_str) != Some("success") {
            let (code, message) = failure_fields(&data, default_code);
            error!(path, code = %code, message = %message, "device query failed");
            return Err(AgentError::Tool { code, message });
        }
        Ok(data)
    }

    /// Sends user feedback about the agent and returns the raw reply.
    pub async fn send_feedback(&self, message: &str, rating: i32) -> Result<Value, AgentError> {
        info!(message_len = message.len(), rating, "sending feedback");
        let body = json!({ "comments": message, "rating": rating });
        Ok(self.inner.gateway.send(GatewayRequest::post(FEEDBACK, body)).await?)
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn failure_fields(data: &Value, default_code: &str) -> (String, String) {
    let field = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
    };
    (
        field("error").unwrap_or_else(|| default_code.to_string()),
        field("message").unwrap_or_else(|| "Unknown error".to_string()),
    )
}

fn tool_result(name: &str, data: Value) -> RunResult {
    if data.get("status").and_then(Value::as_str) == Some("success") {
        return RunResult::succeeded(format!("{name} executed"))
            .with_raw(RawOrigin::Response(data));
    }
    let (code, message) = failure_fields(&data, &format!("{name}_failed"));
    error!(tool = name, code = %code, message = %message, "device tool rejected");
    RunResult::failed(code.clone(), format!("{code}: {message}")).with_raw(RawOrigin::Response(data))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::callbacks::Callbacks;
    use crate::config::AgentConfig;
    use crate::errors::GatewayError;
    use crate::testing::FakeGateway;

    fn client(gateway: &Arc<FakeGateway>, config: AgentConfig) -> AgentClient {
        AgentClient::builder()
            .config(config.use_default_callbacks(false))
            .gateway(gateway.clone())
            .callbacks(Callbacks::new())
            .build()
            .expect("client")
    }

    fn plain(gateway: &Arc<FakeGateway>) -> AgentClient {
        client(gateway, AgentConfig::new("http://helper.test"))
    }

    #[tokio::test]
    async fn tap_posts_coordinates_with_session() {
        let gateway = Arc::new(FakeGateway::new());
        let client = plain(&gateway);

        let result = client.tap(120, 480).await;

        assert!(result.success);
        assert_eq!(result.output, "tap executed");
        assert_eq!(
            gateway.body_of("/v1/tools/tap"),
            Some(json!({ "x": 120, "y": 480, "session_id": "s-1" }))
        );
        assert!(matches!(result.raw, Some(RawOrigin::Response(_))));
    }

    #[tokio::test]
    async fn rejected_tool_reports_code_and_reason() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.reply(
            "/v1/tools/back",
            Ok(json!({ "status": "error", "message": "no activity" })),
        );
        let client = plain(&gateway);

        let result = client.back().await;

        assert!(!result.success);
        assert_eq!(result.code(), "back_failed");
        assert_eq!(result.reason, "back_failed: no activity");
    }

    #[tokio::test]
    async fn transport_failure_maps_to_gateway_code() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.reply(
            "/v1/tools/home",
            Err(GatewayError::ConnectionFailed {
                path: "/v1/tools/home".into(),
                message: "refused".into(),
            }),
        );
        let client = plain(&gateway);

        assert_eq!(client.home().await.code(), "connection_failed");
    }

    #[tokio::test]
    async fn invalid_arguments_skip_the_network() {
        let gateway = Arc::new(FakeGateway::new());
        let client = plain(&gateway);

        assert_eq!(client.swipe((0, 0), (10, 10), 0).await.code(), "invalid_argument");
        assert_eq!(client.input_text("").await.code(), "invalid_argument");
        assert_eq!(client.start_app(" ", None).await.code(), "invalid_argument");
        assert_eq!(client.delay(0).await.code(), "invalid_argument");
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn start_app_sends_optional_activity() {
        let gateway = Arc::new(FakeGateway::new());
        let client = plain(&gateway);

        assert!(client.start_app("com.android.settings", None).await.success);
        let body = gateway.body_of("/v1/tools/start_app").expect("body");
        assert!(body.get("activity").is_none());

        assert!(client.start_app("com.android.settings", Some(".Main")).await.success);
        let body = gateway.body_of("/v1/tools/start_app").expect("body");
        assert_eq!(body["activity"], ".Main");
    }

    #[tokio::test]
    async fn screenshot_decodes_and_saves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let configured = dir.path().join("latest.png");
        let requested = dir.path().join("requested.png");
        let png = vec![0x89, b'P', b'N', b'G', 0, 1, 2];
        let gateway = Arc::new(FakeGateway::new());
        gateway.reply(
            SCREENSHOT,
            Ok(json!({ "status": "success", "data": { "screenshot_base64": B64.encode(&png) } })),
        );
        let client = client(
            &gateway,
            AgentConfig::new("http://helper.test").screenshot_path(configured.clone()),
        );

        let bytes = client.screenshot(Some(&requested)).await.expect("screenshot");

        assert_eq!(bytes, png);
        assert_eq!(std::fs::read(&configured).expect("configured copy"), png);
        assert_eq!(std::fs::read(&requested).expect("requested copy"), png);
        assert_eq!(gateway.body_of(SCREENSHOT), Some(json!({ "session_id": "s-1" })));
    }

    #[tokio::test]
    async fn screenshot_without_data_fails() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.reply(SCREENSHOT, Ok(json!({ "status": "success", "data": {} })));
        let client = plain(&gateway);

        let err = client.screenshot(None).await.expect_err("missing data");
        assert_eq!(err.code(), "screenshot_failed");
    }

    #[tokio::test]
    async fn ui_tree_returns_dump() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ui.xml");
        let gateway = Arc::new(FakeGateway::new());
        gateway.reply(
            UI_DUMP,
            Ok(json!({ "status": "success", "data": { "ui_dump": "<hierarchy/>" } })),
        );
        let client = plain(&gateway);

        let dump = client.ui_tree(Some(&path)).await.expect("ui tree");

        assert_eq!(dump, "<hierarchy/>");
        assert_eq!(std::fs::read_to_string(&path).expect("saved"), "<hierarchy/>");
    }

    #[tokio::test]
    async fn ui_tree_failure_uses_server_code() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.reply(
            UI_DUMP,
            Ok(json!({ "status": "error", "error": "adb_offline", "message": "device offline" })),
        );
        let client = plain(&gateway);

        let err = client.ui_tree(None).await.expect_err("rejected");
        assert_eq!(err.code(), "adb_offline");
    }

    #[tokio::test]
    async fn feedback_posts_comments_and_rating() {
        let gateway = Arc::new(FakeGateway::new());
        let client = plain(&gateway);

        client.send_feedback("worked well", 5).await.expect("feedback");

        assert_eq!(
            gateway.body_of(FEEDBACK),
            Some(json!({ "comments": "worked well", "rating": 5 }))
        );
    }
}
