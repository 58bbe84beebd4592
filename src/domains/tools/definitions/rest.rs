//! Declarative REST tools.
//!
//! A locator such as `rest:GET https://api.example.com/series/{series_id}`
//! names the method and a URL template. Placeholders are filled from the
//! arguments; the remaining arguments go to the query string for
//! GET/DELETE or to a JSON body otherwise.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::domains::tools::capability::{JsonObject, Tool, ToolCore, ToolKind};
use crate::domains::tools::descriptor::ToolDescriptor;
use crate::domains::tools::error::ExecutionError;
use crate::domains::tools::schema::ToolSchema;

const BODY_SNIPPET_LIMIT: usize = 512;

/// Parsed `METHOD url-template` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RestTemplate {
    method: Method,
    url: String,
    placeholders: Vec<String>,
}

/// A concrete request produced from a template and arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

impl RestTemplate {
    /// Parse `"GET https://host/path/{id}"`. A bare URL defaults to GET.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let spec = spec.trim();
        let (method, url) = match spec.split_once(char::is_whitespace) {
            Some((method, url)) => {
                let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|_| format!("invalid HTTP method '{}'", method))?;
                (method, url.trim())
            }
            None => (Method::GET, spec),
        };

        let placeholders = extract_placeholders(url)?;

        let mut probe = url.to_string();
        for name in &placeholders {
            probe = probe.replace(&format!("{{{}}}", name), "x");
        }
        let parsed = reqwest::Url::parse(&probe).map_err(|e| format!("invalid URL '{}': {}", url, e))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("unsupported URL scheme '{}'", parsed.scheme()));
        }

        Ok(Self {
            method,
            url: url.to_string(),
            placeholders,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Fill the template from arguments.
    pub fn render(&self, args: &JsonObject) -> Result<RenderedRequest, ExecutionError> {
        let mut url = self.url.clone();
        for name in &self.placeholders {
            let value = args.get(name).ok_or_else(|| {
                ExecutionError::failed(format!("missing value for URL placeholder '{}'", name))
            })?;
            url = url.replace(&format!("{{{}}}", name), &scalar_to_string(value));
        }

        let rest: BTreeMap<&String, &Value> = args
            .iter()
            .filter(|(k, _)| !self.placeholders.contains(k))
            .collect();

        let sends_body = !matches!(self.method, Method::GET | Method::DELETE | Method::HEAD);
        if sends_body {
            let body: JsonObject = rest.into_iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            return Ok(RenderedRequest {
                method: self.method.clone(),
                url,
                body: Some(Value::Object(body)),
            });
        }

        let pairs: Vec<(&str, String)> = rest
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.as_str(), scalar_to_string(v)))
            .collect();
        if !pairs.is_empty() {
            let query = serde_urlencoded::to_string(&pairs)
                .map_err(|e| ExecutionError::failed(format!("failed to encode query: {}", e)))?;
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }

        Ok(RenderedRequest {
            method: self.method.clone(),
            url,
            body: None,
        })
    }
}

fn extract_placeholders(url: &str) -> Result<Vec<String>, String> {
    let mut names = Vec::new();
    let mut rest = url;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unclosed placeholder in '{}'", url))?;
        let name = &after[..end];
        if name.is_empty() {
            return Err(format!("empty placeholder in '{}'", url));
        }
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        rest = &after[end + 1..];
    }
    Ok(names)
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A tool that calls an HTTP endpoint.
pub struct RestTool {
    core: ToolCore,
    template: RestTemplate,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl RestTool {
    pub fn new(
        descriptor: Arc<ToolDescriptor>,
        schema: ToolSchema,
        template: RestTemplate,
        client: reqwest::Client,
    ) -> Self {
        let headers = descriptor
            .config
            .get("headers")
            .and_then(Value::as_object)
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            core: ToolCore::new(descriptor, schema),
            template,
            headers,
            client,
        }
    }
}

#[async_trait]
impl Tool for RestTool {
    fn describe(&self) -> Arc<ToolDescriptor> {
        self.core.descriptor.clone()
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Rest
    }

    fn schema(&self) -> &ToolSchema {
        &self.core.schema
    }

    #[instrument(skip_all, fields(tool = %self.core.name()))]
    async fn execute(&self, args: JsonObject) -> Result<Value, ExecutionError> {
        let request = self.template.render(&args)?;
        info!("{} {}", request.method, request.url);

        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ExecutionError::network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutionError::network(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            let snippet: String = text.chars().take(BODY_SNIPPET_LIMIT).collect();
            return Err(
                ExecutionError::upstream(status.as_u16(), format!("upstream returned {}", status))
                    .with_data(json!({ "status": status.as_u16(), "body": snippet })),
            );
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ExecutionError::parse(format!("response is not JSON: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_with_method() {
        let template = RestTemplate::parse("post https://api.example.com/series/{id}").unwrap();
        assert_eq!(template.method(), &Method::POST);
        assert_eq!(template.placeholders(), &["id".to_string()]);
    }

    #[test]
    fn test_parse_bare_url_defaults_to_get() {
        let template = RestTemplate::parse("https://api.example.com/health").unwrap();
        assert_eq!(template.method(), &Method::GET);
        assert!(template.placeholders().is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_templates() {
        assert!(RestTemplate::parse("GET https://x/{id").is_err());
        assert!(RestTemplate::parse("GET https://x/{}").is_err());
        assert!(RestTemplate::parse("GET ftp://x/").is_err());
        assert!(RestTemplate::parse("GET not a url").is_err());
    }

    #[test]
    fn test_render_get_puts_rest_in_query() {
        let template =
            RestTemplate::parse("GET https://api.example.com/series/{series_id}/observations")
                .unwrap();
        let request = template
            .render(&args(json!({ "series_id": "GDP", "limit": 5, "units": "pch" })))
            .unwrap();
        assert_eq!(
            request.url,
            "https://api.example.com/series/GDP/observations?limit=5&units=pch"
        );
        assert!(request.body.is_none());
    }

    #[test]
    fn test_render_post_puts_rest_in_body() {
        let template = RestTemplate::parse("POST https://api.example.com/items/{id}").unwrap();
        let request = template
            .render(&args(json!({ "id": 7, "name": "widget" })))
            .unwrap();
        assert_eq!(request.url, "https://api.example.com/items/7");
        assert_eq!(request.body, Some(json!({ "name": "widget" })));
    }

    #[test]
    fn test_render_missing_placeholder() {
        let template = RestTemplate::parse("GET https://api.example.com/{id}").unwrap();
        assert!(template.render(&args(json!({}))).is_err());
    }
}
