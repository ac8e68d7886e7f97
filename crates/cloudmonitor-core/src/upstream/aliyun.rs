//! Aliyun CloudMonitor client (`DescribeMetricLast`, RPC style, HMAC-SHA1).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use tracing::{debug, trace};

use super::{CloudMonitorApi, RawDataPoint, TimeRange, UpstreamError};

const API_VERSION: &str = "2019-01-01";
const ACTION: &str = "DescribeMetricLast";
/// Upper bound on followed `NextToken` pages for a single query.
const MAX_PAGES: usize = 100;

/// Connection settings for [`AliyunClient`].
#[derive(Debug, Clone)]
pub struct AliyunConfig {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub region: String,
    /// Overrides the regional endpoint (`https://metrics.<region>.aliyuncs.com/`).
    pub endpoint: Option<String>,
    /// Aggregation period requested from the API.
    pub period: Duration,
    /// Data points per page.
    pub page_size: u32,
    /// Per-request timeout, including connect.
    pub timeout: Duration,
}

impl AliyunConfig {
    pub fn new(
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
            region: region.into(),
            endpoint: None,
            period: Duration::from_secs(60),
            page_size: 1000,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(url) => url.clone(),
            None => format!("https://metrics.{}.aliyuncs.com/", self.region),
        }
    }
}

/// HTTPS client for the CloudMonitor metrics API.
#[derive(Debug, Clone)]
pub struct AliyunClient {
    http: reqwest::Client,
    config: AliyunConfig,
    endpoint: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeMetricLastResponse {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    next_token: Option<String>,
    /// JSON-encoded array of data points.
    #[serde(default)]
    datapoints: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

impl DescribeMetricLastResponse {
    fn code(&self) -> String {
        match &self.code {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    fn is_success(&self) -> bool {
        let code = self.code();
        self.success.unwrap_or(code.is_empty() || code == "200")
    }
}

impl AliyunClient {
    pub fn new(config: AliyunConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("cloudmonitor-exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let endpoint = config.endpoint_url();
        Ok(Self {
            http,
            config,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_params(
        &self,
        namespace: &str,
        metric: &str,
        range: TimeRange,
        next_token: Option<&str>,
    ) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            params.insert(k.to_string(), v);
        };
        put("Action", ACTION.to_string());
        put("Version", API_VERSION.to_string());
        put("Format", "JSON".to_string());
        put("AccessKeyId", self.config.access_key_id.clone());
        put("SignatureMethod", "HMAC-SHA1".to_string());
        put("SignatureVersion", "1.0".to_string());
        put("SignatureNonce", uuid::Uuid::new_v4().to_string());
        put("Timestamp", Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        put("RegionId", self.config.region.clone());
        put("Namespace", namespace.to_string());
        put("MetricName", metric.to_string());
        put("Period", self.config.period.as_secs().to_string());
        put("StartTime", range.start.timestamp_millis().to_string());
        put("EndTime", range.end.timestamp_millis().to_string());
        put("Length", self.config.page_size.to_string());
        if let Some(token) = next_token {
            put("NextToken", token.to_string());
        }
        params
    }

    async fn fetch_page(
        &self,
        namespace: &str,
        metric: &str,
        range: TimeRange,
        next_token: Option<&str>,
    ) -> Result<DescribeMetricLastResponse, UpstreamError> {
        let params = self.request_params(namespace, metric, range, next_token);
        let url = format!(
            "{}?{}",
            self.endpoint,
            signed_query(&params, &self.config.access_key_secret)
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let parsed: DescribeMetricLastResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) if status >= 400 => {
                trace!(error = %e, status, "undecodable error body");
                return Err(classify(status, "", &truncate(&body, 200)));
            }
            Err(e) => return Err(UpstreamError::Decode(e.to_string())),
        };

        if status >= 400 || !parsed.is_success() {
            return Err(classify(
                status,
                &parsed.code(),
                parsed.message.as_deref().unwrap_or_default(),
            ));
        }

        debug!(
            namespace,
            metric,
            request_id = parsed.request_id.as_deref().unwrap_or("-"),
            "DescribeMetricLast page received"
        );
        Ok(parsed)
    }
}

#[async_trait]
impl CloudMonitorApi for AliyunClient {
    async fn query(
        &self,
        namespace: &str,
        metric: &str,
        range: TimeRange,
    ) -> Result<Vec<RawDataPoint>, UpstreamError> {
        let mut points = Vec::new();
        let mut next_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let page = self
                .fetch_page(namespace, metric, range, next_token.as_deref())
                .await?;
            points.extend(parse_datapoints(page.datapoints.as_deref())?);

            match page.next_token.filter(|t| !t.is_empty()) {
                Some(token) if Some(&token) != next_token.as_ref() => next_token = Some(token),
                _ => return Ok(points),
            }
        }

        debug!(namespace, metric, pages = MAX_PAGES, "page limit reached");
        Ok(points)
    }
}

fn parse_datapoints(raw: Option<&str>) -> Result<Vec<RawDataPoint>, UpstreamError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(s) => serde_json::from_str(s).map_err(|e| UpstreamError::Decode(e.to_string())),
    }
}

/// Maps an API failure onto the error taxonomy.
pub(crate) fn classify(status: u16, code: &str, message: &str) -> UpstreamError {
    let auth_codes = ["InvalidAccessKeyId", "SignatureDoesNotMatch", "Forbidden", "InvalidAuthorization"];
    if status == 401 || status == 403 || auth_codes.iter().any(|c| code.starts_with(c)) {
        return UpstreamError::Auth(format!("{} {}", code, message).trim().to_string());
    }
    if status == 429 || code.starts_with("Throttling") {
        return UpstreamError::Throttled(format!("{} {}", code, message).trim().to_string());
    }
    UpstreamError::Api {
        code: if code.is_empty() {
            status.to_string()
        } else {
            code.to_string()
        },
        message: message.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Percent-encodes per RFC 3986: only `A-Z a-z 0-9 - _ . ~` pass through.
pub(crate) fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Sorted `k=v&...` form of the parameters, each side percent-encoded.
pub(crate) fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

pub(crate) fn string_to_sign(canonical: &str) -> String {
    format!("GET&{}&{}", percent_encode("/"), percent_encode(canonical))
}

pub(crate) fn sign(string_to_sign: &str, secret: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(format!("{}&", secret).as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(string_to_sign.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Canonical query string with the `Signature` parameter appended.
pub(crate) fn signed_query(params: &BTreeMap<String, String>, secret: &str) -> String {
    let canonical = canonical_query(params);
    let signature = sign(&string_to_sign(&canonical), secret);
    format!("{}&Signature={}", canonical, percent_encode(&signature))
}
