use async_trait::async_trait;
use loomcore::{Node, NodeContext, NodeError, NodeOutput};
use loomruntime::{NodeFactory, NodeMetadata, PortDefinition};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
struct HttpConfig {
    #[serde(default = "default_method")]
    method: String,
    /// Used when the input carries no `url`
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    /// Treat 4xx/5xx responses as node failures
    #[serde(default = "default_true")]
    fail_on_status: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

impl HttpConfig {
    fn parse(config: &HashMap<String, Value>) -> Result<Self, NodeError> {
        let config: HttpConfig = serde_json::from_value(Value::Object(
            config.clone().into_iter().collect::<Map<_, _>>(),
        ))
        .map_err(|e| NodeError::Configuration(e.to_string()))?;
        config.method()?;
        Ok(config)
    }

    fn method(&self) -> Result<Method, NodeError> {
        match self.method.to_uppercase().as_str() {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            "PATCH" => Ok(Method::PATCH),
            "DELETE" => Ok(Method::DELETE),
            other => Err(NodeError::Configuration(format!(
                "Unsupported method: {}",
                other
            ))),
        }
    }
}

/// HTTP request node
pub struct HttpRequestNode {
    client: reqwest::Client,
    config: HttpConfig,
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_type(&self) -> &str {
        "http.request"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let url = match ctx.inputs.get("url") {
            Some(_) => ctx.require_str("url")?.to_string(),
            None => self
                .config
                .url
                .clone()
                .ok_or_else(|| NodeError::MissingInput("url".to_string()))?,
        };
        let method = self.config.method()?;

        ctx.events.info(format!("{} {}", method, url));

        let mut request = self.client.request(method.clone(), &url);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if let Some(timeout_ms) = self.config.timeout_ms {
            request = request.timeout(Duration::from_millis(timeout_ms));
        }
        if method != Method::GET && method != Method::DELETE {
            match ctx.inputs.get("body") {
                Some(Value::String(text)) => request = request.body(text.clone()),
                Some(body) => request = request.json(body),
                None => {}
            }
        }

        let response = tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            response = request.send() => response
                .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?,
        };

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.to_string(), Value::String(v.to_string())))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        ctx.events.info(format!("Response status: {}", status.as_u16()));
        tracing::debug!(node_id = %ctx.node_id, %url, status = status.as_u16(), "HTTP request finished");

        if self.config.fail_on_status && (status.is_client_error() || status.is_server_error()) {
            return Err(NodeError::ExecutionFailed(format!(
                "{} {} returned {}",
                method, url, status
            )));
        }

        let mut output = NodeOutput::new()
            .with_output("status", status.as_u16())
            .with_output("headers", Value::Object(headers));
        if let Ok(json) = serde_json::from_str::<Value>(&body) {
            output = output.with_output("json", json);
        }
        Ok(output.with_output("body", body))
    }
}

pub struct HttpRequestNodeFactory {
    client: reqwest::Client,
}

impl HttpRequestNodeFactory {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestNodeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeFactory for HttpRequestNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(HttpRequestNode {
            client: self.client.clone(),
            config: HttpConfig::parse(config)?,
        }))
    }

    fn node_type(&self) -> &str {
        "http.request"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Make HTTP requests".to_string(),
            category: "http".to_string(),
            inputs: vec![
                PortDefinition::optional("url", "Target URL; falls back to config `url`"),
                PortDefinition::optional("body", "Request body for POST, PUT and PATCH"),
            ],
            outputs: vec![
                PortDefinition::required("status", "Response status code"),
                PortDefinition::required("headers", "Response headers"),
                PortDefinition::required("body", "Response body as text"),
                PortDefinition::optional("json", "Response body, when it is JSON"),
            ],
        }
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        HttpConfig::parse(config).map(|_| ())
    }
}
