//! Remote challenge-solving proxy backend speaking the FlareSolverr v1 API.

use super::{RequestOptions, Response, Transport, TransportError, TransportKind};
use crate::entry::{parse_cookie_header, SignInEntry};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolverRequest<'a> {
    cmd: &'static str,
    url: &'a str,
    max_timeout: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cookies: Vec<SolverCookie>,
    #[serde(skip_serializing_if = "Option::is_none")]
    post_data: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SolverCookie {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SolverReply {
    status: String,
    #[serde(default)]
    message: String,
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
struct Solution {
    url: String,
    status: u16,
    #[serde(default)]
    headers: HashMap<String, Value>,
    #[serde(default)]
    response: String,
    #[serde(default)]
    cookies: Vec<SolverCookie>,
}

pub struct FlareSolverrTransport {
    endpoint: String,
    max_timeout: Duration,
    client: reqwest::Client,
}

impl FlareSolverrTransport {
    /// `server_url` is the service root, e.g. `http://localhost:8191`.
    pub fn new(server_url: &str, max_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(max_timeout + Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Backend(format!("failed to build proxy client: {e}")))?;
        Ok(Self {
            endpoint: format!("{}/v1", server_url.trim_end_matches('/')),
            max_timeout,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for FlareSolverrTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Proxy
    }

    async fn execute(
        &self,
        entry: &SignInEntry,
        method: &Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response, TransportError> {
        let cmd = match *method {
            Method::GET => "request.get",
            Method::POST => "request.post",
            _ => {
                return Err(TransportError::Backend(format!(
                    "proxy backend does not support {method}"
                )))
            }
        };
        let post_data = post_data(options)?;
        let max_timeout = options.timeout.unwrap_or(self.max_timeout);
        let cookies = entry
            .session_cookie
            .as_deref()
            .or(entry.cookie.as_deref())
            .map(parse_cookie_header)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| SolverCookie { name, value })
            .collect();

        let body = SolverRequest {
            cmd,
            url,
            max_timeout: max_timeout.as_millis() as u64,
            cookies,
            post_data,
        };
        debug!(site = %entry.site_name, "Proxy {} {}", cmd, url);

        let reply = self
            .client
            .post(&self.endpoint)
            .timeout(max_timeout + Duration::from_secs(10))
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(format!("proxy at {} unreachable: {e}", self.endpoint)))?;
        let http_status = reply.status();
        let reply: SolverReply = reply
            .json()
            .await
            .map_err(|e| TransportError::Backend(format!("invalid proxy reply ({http_status}): {e}")))?;

        if reply.status != "ok" {
            return Err(TransportError::Backend(format!(
                "proxy failed for {url}: {}",
                reply.message
            )));
        }
        let solution = reply
            .solution
            .ok_or_else(|| TransportError::Backend(format!("proxy returned no solution for {url}")))?;

        let headers = solution
            .headers
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();
        let cookies = solution
            .cookies
            .into_iter()
            .map(|c| (c.name, c.value))
            .collect();

        let mut response = Response::html(
            solution.status,
            solution.url,
            solution.response,
            TransportKind::Proxy,
        )
        .with_cookies(cookies);
        response.headers = headers;
        Ok(response)
    }
}

/// Form body as the service expects it. The v1 API only carries
/// url-encoded forms and has no per-request headers.
fn post_data(options: &RequestOptions) -> Result<Option<String>, TransportError> {
    if options.json.is_some() {
        return Err(TransportError::Backend(
            "proxy backend cannot send JSON bodies".into(),
        ));
    }
    if !options.headers.is_empty() {
        return Err(TransportError::Backend(
            "proxy backend cannot send request headers".into(),
        ));
    }
    Ok(options.form.as_ref().map(|form| {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form)
            .finish()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[tokio::test]
    async fn forwards_cookies_and_parses_solution() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1")
            .match_body(Matcher::PartialJson(json!({
                "cmd": "request.post",
                "url": "https://pt.example/attendance.php",
                "cookies": [{"name": "uid", "value": "7"}],
                "postData": "answer=3"
            })))
            .with_status(200)
            .with_body(
                json!({
                    "status": "ok",
                    "message": "",
                    "solution": {
                        "url": "https://pt.example/attendance.php",
                        "status": 200,
                        "headers": {"content-type": "text/html"},
                        "response": "<p>签到成功</p>",
                        "cookies": [{"name": "cf_clearance", "value": "xyz", "domain": ".pt.example"}],
                        "userAgent": "Mozilla/5.0"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let transport = FlareSolverrTransport::new(&server.url(), Duration::from_secs(5)).unwrap();
        let entry = SignInEntry::new("demo", "https://pt.example/").with_cookie("uid=7");
        let options = RequestOptions::default().form([("answer", "3")]);
        let response = transport
            .execute(&entry, &Method::POST, "https://pt.example/attendance.php", &options)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.served_by, TransportKind::Proxy);
        assert!(response.text.contains("签到成功"));
        assert_eq!(response.cookies, vec![("cf_clearance".into(), "xyz".into())]);
        assert_eq!(response.header("Content-Type"), Some("text/html"));
    }

    #[tokio::test]
    async fn json_and_headers_are_refused_before_calling_the_service() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/v1").expect(0).create_async().await;
        let transport = FlareSolverrTransport::new(&server.url(), Duration::from_secs(5)).unwrap();
        let entry = SignInEntry::new("demo", "https://pt.example/");

        let json = RequestOptions::default().json(json!({"action": "sign"}));
        let err = transport
            .execute(&entry, &Method::POST, "https://pt.example/sign", &json)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("JSON"));

        let headed = RequestOptions::default().header("X-Requested-With", "XMLHttpRequest");
        let err = transport
            .execute(&entry, &Method::GET, "https://pt.example/", &headed)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("headers"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn request_timeout_becomes_max_timeout() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1")
            .match_body(Matcher::PartialJson(json!({"cmd": "request.get", "maxTimeout": 7000})))
            .with_body(
                json!({
                    "status": "ok",
                    "solution": {"url": "https://pt.example/", "status": 200, "response": "ok"}
                })
                .to_string(),
            )
            .create_async()
            .await;
        let transport = FlareSolverrTransport::new(&server.url(), Duration::from_secs(60)).unwrap();
        let entry = SignInEntry::new("demo", "https://pt.example/");
        let options = RequestOptions::default().timeout(Duration::from_secs(7));
        transport
            .execute(&entry, &Method::GET, "https://pt.example/", &options)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_service_is_backend_unavailable() {
        let transport = FlareSolverrTransport::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let entry = SignInEntry::new("demo", "https://pt.example/");
        let err = transport
            .execute(&entry, &Method::GET, "https://pt.example/", &RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::outcome::FailureKind::BackendUnavailable);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1")
            .with_status(500)
            .with_body(json!({"status": "error", "message": "Challenge not solved"}).to_string())
            .create_async()
            .await;
        let transport = FlareSolverrTransport::new(&server.url(), Duration::from_secs(5)).unwrap();
        let entry = SignInEntry::new("demo", "https://pt.example/");
        let err = transport
            .execute(&entry, &Method::GET, "https://pt.example/", &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Challenge not solved"));
    }
}
