//! Actions every engine instance can register.
//!
//! | Type               | Behaviour                                                     |
//! |--------------------|---------------------------------------------------------------|
//! | `echo`             | Returns its inputs unchanged                                  |
//! | `template`         | Renders `{{ name }}` placeholders in `config.template`        |
//! | `regex_substitute` | Replaces `pattern` matches in `text` with `repl`              |
//! | `json_select`      | Selects a dotted path from a JSON value                       |
//! | `http_request`     | Performs an HTTP request and returns status, text, and JSON   |

use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use chainfury_types::{ActionSchema, FieldSpec, FieldType, FieldValidation};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Method;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tracing::debug;

use super::{Action, ActionContext, ActionRegistry};
use crate::{error::RegistryError, resolve::select_path};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}").expect("placeholder pattern compiles"));

const HTTP_TIMEOUT_MS: u64 = 30_000;

/// Register all built-in actions.
pub fn register_builtin_actions(registry: &mut ActionRegistry) -> Result<(), RegistryError> {
    registry.register("echo", echo_schema(), EchoAction)?;
    registry.register("template", template_schema(), TemplateAction)?;
    registry.register("regex_substitute", regex_substitute_schema(), RegexSubstituteAction)?;
    registry.register("json_select", json_select_schema(), JsonSelectAction)?;
    registry.register_shared("http_request", http_request_schema(), Arc::new(HttpRequestAction::default()))?;
    Ok(())
}

fn echo_schema() -> ActionSchema {
    ActionSchema::new("Returns its inputs unchanged").tag("utility").with_additional_inputs()
}

fn template_schema() -> ActionSchema {
    ActionSchema::new("Renders {{ name }} placeholders in config.template from the node inputs")
        .tag("text_to_text")
        .with_additional_inputs()
        .output("text", FieldSpec::optional(FieldType::String))
}

fn regex_substitute_schema() -> ActionSchema {
    ActionSchema::new("Replaces every match of a regular expression")
        .tag("text_to_text")
        .input("pattern", FieldSpec::required(FieldType::String).with_description("Regular expression to match"))
        .input("repl", FieldSpec::required(FieldType::String).with_description("Replacement, may use $1 style groups"))
        .input("text", FieldSpec::required(FieldType::String).with_description("Text to search"))
        .input(
            "count",
            FieldSpec::optional(FieldType::Integer)
                .with_default(0)
                .with_description("Maximum replacements; 0 replaces all"),
        )
        .output("text", FieldSpec::optional(FieldType::String))
}

fn json_select_schema() -> ActionSchema {
    ActionSchema::new("Selects a value from JSON by dotted path")
        .tag("utility")
        .input("value", FieldSpec::required(FieldType::Any))
        .input("path", FieldSpec::required(FieldType::String).with_description("Dotted path, e.g. items.0.name"))
        .output("value", FieldSpec::optional(FieldType::Any))
}

fn http_request_schema() -> ActionSchema {
    let methods = ["get", "post", "put", "patch", "delete", "head"].into_iter().map(JsonValue::from).collect();
    ActionSchema::new("Performs an HTTP request")
        .tag("network")
        .input(
            "method",
            FieldSpec::optional(FieldType::String).with_default("get").with_validation(FieldValidation {
                allowed_values: methods,
                ..Default::default()
            }),
        )
        .input(
            "url",
            FieldSpec::required(FieldType::String).with_validation(FieldValidation {
                pattern: Some("^https?://".to_string()),
                ..Default::default()
            }),
        )
        .input("headers", FieldSpec::optional(FieldType::Object).secret())
        .input("params", FieldSpec::optional(FieldType::Object))
        .input("body", FieldSpec::optional(FieldType::Any))
        .output("status", FieldSpec::optional(FieldType::Integer))
        .output("text", FieldSpec::optional(FieldType::String))
        .output("json", FieldSpec::optional(FieldType::Any))
        .with_timeout_ms(HTTP_TIMEOUT_MS)
}

struct EchoAction;

#[async_trait]
impl Action for EchoAction {
    async fn invoke(&self, _config: &JsonMap<String, JsonValue>, inputs: &JsonMap<String, JsonValue>, _ctx: &ActionContext) -> anyhow::Result<JsonValue> {
        Ok(JsonValue::Object(inputs.clone()))
    }
}

struct TemplateAction;

#[async_trait]
impl Action for TemplateAction {
    async fn invoke(&self, config: &JsonMap<String, JsonValue>, inputs: &JsonMap<String, JsonValue>, _ctx: &ActionContext) -> anyhow::Result<JsonValue> {
        let template = config
            .get("template")
            .and_then(JsonValue::as_str)
            .context("config.template must be a string")?;
        let text = render_template(template, inputs)?;
        Ok(json!({ "text": text }))
    }
}

/// Substitute `{{ name }}` placeholders. Strings are inserted verbatim, other values as JSON.
pub fn render_template(template: &str, values: &JsonMap<String, JsonValue>) -> anyhow::Result<String> {
    let root = JsonValue::Object(values.clone());
    let mut unresolved: Vec<String> = Vec::new();
    let rendered = PLACEHOLDER.replace_all(template, |captures: &regex::Captures| {
        let path = &captures[1];
        match select_path(&root, path) {
            Some(JsonValue::String(text)) => text.clone(),
            Some(value) => value.to_string(),
            None => {
                unresolved.push(path.to_string());
                String::new()
            }
        }
    });
    if !unresolved.is_empty() {
        bail!("template placeholders have no value: {}", unresolved.join(", "));
    }
    Ok(rendered.into_owned())
}

struct RegexSubstituteAction;

#[async_trait]
impl Action for RegexSubstituteAction {
    async fn invoke(&self, _config: &JsonMap<String, JsonValue>, inputs: &JsonMap<String, JsonValue>, _ctx: &ActionContext) -> anyhow::Result<JsonValue> {
        let pattern = string_input(inputs, "pattern")?;
        let replacement = string_input(inputs, "repl")?;
        let text = string_input(inputs, "text")?;
        let count = inputs.get("count").and_then(JsonValue::as_u64).unwrap_or(0);

        let regex = Regex::new(pattern).with_context(|| format!("invalid pattern '{}'", pattern))?;
        let limit = usize::try_from(count).context("count is too large")?;
        Ok(json!({ "text": regex.replacen(text, limit, replacement) }))
    }
}

struct JsonSelectAction;

#[async_trait]
impl Action for JsonSelectAction {
    async fn invoke(&self, _config: &JsonMap<String, JsonValue>, inputs: &JsonMap<String, JsonValue>, _ctx: &ActionContext) -> anyhow::Result<JsonValue> {
        let path = string_input(inputs, "path")?;
        let value = inputs.get("value").context("missing input 'value'")?;
        let parsed;
        let source = match value {
            JsonValue::String(text) => match serde_json::from_str::<JsonValue>(text) {
                Ok(json) => {
                    parsed = json;
                    &parsed
                }
                Err(_) => value,
            },
            other => other,
        };
        let selected = select_path(source, path).ok_or_else(|| anyhow!("path '{}' does not exist in the value", path))?;
        Ok(json!({ "value": selected }))
    }
}

#[derive(Default)]
struct HttpRequestAction {
    client: reqwest::Client,
}

#[async_trait]
impl Action for HttpRequestAction {
    async fn invoke(&self, _config: &JsonMap<String, JsonValue>, inputs: &JsonMap<String, JsonValue>, ctx: &ActionContext) -> anyhow::Result<JsonValue> {
        let method_text = inputs.get("method").and_then(JsonValue::as_str).unwrap_or("get");
        let method = Method::from_bytes(method_text.to_ascii_uppercase().as_bytes()).with_context(|| format!("invalid method '{}'", method_text))?;
        let url = string_input(inputs, "url")?;

        let mut request = self.client.request(method.clone(), url);
        if let Some(headers) = inputs.get("headers").and_then(JsonValue::as_object) {
            for (name, value) in headers {
                let value = match value {
                    JsonValue::String(text) => text.clone(),
                    other => other.to_string(),
                };
                request = request.header(name.as_str(), value);
            }
        }
        if let Some(params) = inputs.get("params").and_then(JsonValue::as_object) {
            let pairs: Vec<(String, String)> = params
                .iter()
                .map(|(name, value)| match value {
                    JsonValue::String(text) => (name.clone(), text.clone()),
                    other => (name.clone(), other.to_string()),
                })
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = inputs.get("body").filter(|body| !body.is_null()) {
            request = request.json(body);
        }

        debug!(node_id = %ctx.node_id, method = %method, url = %url, "sending http request");
        let response = tokio::select! {
            response = request.send() => response.with_context(|| format!("request to {} failed", url))?,
            _ = ctx.cancellation.cancelled() => bail!("request to {} was cancelled", url),
        };
        let status = response.status().as_u16();
        let text = response.text().await.context("failed to read response body")?;
        let json = serde_json::from_str::<JsonValue>(&text).unwrap_or(JsonValue::Null);
        Ok(json!({ "status": status, "text": text, "json": json }))
    }
}

fn string_input<'a>(inputs: &'a JsonMap<String, JsonValue>, name: &str) -> anyhow::Result<&'a str> {
    inputs
        .get(name)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| anyhow!("input '{}' must be a string", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::InvokeOptions;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn object(value: JsonValue) -> JsonMap<String, JsonValue> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        register_builtin_actions(&mut registry).expect("builtins register");
        registry
    }

    async fn run(action_type: &str, config: JsonValue, inputs: JsonValue) -> anyhow::Result<JsonValue> {
        Ok(registry()
            .invoke(action_type, "node", &object(config), &object(inputs), InvokeOptions::default())
            .await?)
    }

    #[test]
    fn registering_twice_fails() {
        let mut registry = registry();
        assert!(matches!(
            register_builtin_actions(&mut registry),
            Err(RegistryError::DuplicateActionType { action_type }) if action_type == "echo"
        ));
    }

    #[tokio::test]
    async fn echo_returns_inputs() {
        let value = run("echo", json!({}), json!({"a": 1, "b": "two"})).await.expect("echo");
        assert_eq!(value, json!({"a": 1, "b": "two"}));
    }

    #[tokio::test]
    async fn template_renders_nested_placeholders() {
        let value = run(
            "template",
            json!({"template": "Hi {{ name }}, you have {{stats.count}} items"}),
            json!({"name": "Ada", "stats": {"count": 3}}),
        )
        .await
        .expect("template");
        assert_eq!(value, json!({"text": "Hi Ada, you have 3 items"}));
    }

    #[tokio::test]
    async fn template_reports_unresolved_placeholders() {
        let error = run("template", json!({"template": "{{ missing }}"}), json!({})).await.expect_err("unresolved");
        assert!(error.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn regex_substitute_honours_count() {
        let all = run(
            "regex_substitute",
            json!({}),
            json!({"pattern": "o", "repl": "0", "text": "foo boo"}),
        )
        .await
        .expect("all");
        assert_eq!(all, json!({"text": "f00 b00"}));

        let first = run(
            "regex_substitute",
            json!({}),
            json!({"pattern": "(b)oo", "repl": "${1}ee", "text": "boo boo", "count": 1}),
        )
        .await
        .expect("first");
        assert_eq!(first, json!({"text": "bee boo"}));
    }

    #[tokio::test]
    async fn json_select_accepts_json_text() {
        let value = run("json_select", json!({}), json!({"value": "{\"items\": [{\"name\": \"x\"}]}", "path": "items.0.name"}))
            .await
            .expect("select");
        assert_eq!(value, json!({"value": "x"}));

        let error = run("json_select", json!({}), json!({"value": {"a": 1}, "path": "b"})).await.expect_err("missing");
        assert!(error.to_string().contains("'b'"));
    }

    #[tokio::test]
    async fn http_request_returns_status_text_and_json() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buffer = vec![0u8; 4096];
            let read = socket.read(&mut buffer).await.expect("read");
            let request = String::from_utf8_lossy(&buffer[..read]).to_string();
            let body = r#"{"ok":true}"#;
            let response = format!(
                "HTTP/1.1 201 Created\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            request
        });

        let value = run(
            "http_request",
            json!({}),
            json!({"method": "get", "url": format!("http://{}/items", address), "params": {"page": 2}, "headers": {"token": "abc"}}),
        )
        .await
        .expect("request");

        assert_eq!(value["status"], json!(201));
        assert_eq!(value["json"], json!({"ok": true}));
        let request = server.await.expect("server");
        assert!(request.starts_with("GET /items?page=2 "));
        assert!(request.to_ascii_lowercase().contains("token: abc"));
    }

    #[tokio::test]
    async fn http_request_rejects_non_http_urls() {
        let error = run("http_request", json!({}), json!({"url": "ftp://example.com"})).await.expect_err("invalid url");
        assert!(format!("{error:#}").contains("url"));
    }
}
