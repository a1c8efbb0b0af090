use std::fmt;
use std::io::Read;

use reqwest::blocking::Client;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE, RANGE,
};

use crate::config::DownloadConfig;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub range: Option<(u64, u64)>,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range: None,
        }
    }

    pub fn ranged(url: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            url: url.into(),
            range: Some((start, end)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProbeResponse {
    pub status_code: u16,
    pub total_bytes: Option<u64>,
    pub accept_ranges: bool,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

pub struct BodyResponse {
    pub status_code: u16,
    pub range_total: Option<u64>,
    pub content_disposition: Option<String>,
    pub body: Box<dyn Read + Send>,
}

impl BodyResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

impl fmt::Debug for BodyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyResponse")
            .field("status_code", &self.status_code)
            .field("range_total", &self.range_total)
            .field("content_disposition", &self.content_disposition)
            .finish_non_exhaustive()
    }
}

pub trait NetClient: Send + Sync {
    fn head(&self, req: &HttpRequest) -> CoreResult<ProbeResponse>;
    fn get(&self, req: &HttpRequest) -> CoreResult<BodyResponse>;
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
}

impl ReqwestNetClient {
    pub fn new(config: &DownloadConfig) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .timeout(config.read_timeout())
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    fn request_headers(req: &HttpRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some((start, end)) = req.range {
            let value = format!("bytes={}-{}", start, end);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value).map_err(|err| CoreError::Network(err.to_string()))?,
            );
        }
        Ok(headers)
    }
}

impl NetClient for ReqwestNetClient {
    fn head(&self, req: &HttpRequest) -> CoreResult<ProbeResponse> {
        let resp = self
            .client
            .head(&req.url)
            .headers(Self::request_headers(req)?)
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let headers = resp.headers();
        Ok(ProbeResponse {
            status_code: resp.status().as_u16(),
            total_bytes: header_str(headers, CONTENT_LENGTH.as_str())
                .and_then(|value| value.trim().parse::<u64>().ok()),
            accept_ranges: header_str(headers, ACCEPT_RANGES.as_str())
                .map(|value| value.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false),
            content_type: header_str(headers, CONTENT_TYPE.as_str()).map(str::to_string),
            content_disposition: header_str(headers, CONTENT_DISPOSITION.as_str())
                .map(str::to_string),
        })
    }

    fn get(&self, req: &HttpRequest) -> CoreResult<BodyResponse> {
        let resp = self
            .client
            .get(&req.url)
            .headers(Self::request_headers(req)?)
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let headers = resp.headers();
        let range_total =
            header_str(headers, CONTENT_RANGE.as_str()).and_then(parse_content_range_total);
        let content_disposition =
            header_str(headers, CONTENT_DISPOSITION.as_str()).map(str::to_string);
        Ok(BodyResponse {
            status_code: resp.status().as_u16(),
            range_total,
            content_disposition,
            body: Box::new(resp),
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

// `bytes 0-0/12345` -> `12345`. An unknown complete length (`*`) yields `None`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (_, total) = rest.split_once('/')?;
    total.trim().parse::<u64>().ok()
}
