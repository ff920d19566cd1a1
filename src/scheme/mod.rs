//! Scheme module - Wire request builders and reply parsers
//!
//! Gemini, Gopher and Finger share one request state machine. The only
//! differences are whether the connection is wrapped in TLS and whether the
//! reply starts with a header; [`Scheme`] exposes both as configuration.

pub mod finger;
pub mod gemini;
pub mod gopher;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors raised while turning a URL into a wire request
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemeError {
    #[error("Unsupported scheme: {0}")]
    Unsupported(String),

    #[error("URL has no host: {0}")]
    MissingHost(String),

    #[error("Request URL too long: {0} bytes (max: {1})")]
    UrlTooLong(usize, usize),

    #[error("Invalid percent-encoding in {0}")]
    BadEncoding(String),
}

pub type SchemeResult<T> = Result<T, SchemeError>;

/// Protocols the network process speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Gemini,
    Gopher,
    Finger,
}

impl Scheme {
    /// Whether the connection is wrapped in TLS with a trust check
    pub fn uses_tls(self) -> bool {
        matches!(self, Scheme::Gemini)
    }

    /// Whether the reply starts with a status line
    pub fn has_header(self) -> bool {
        matches!(self, Scheme::Gemini)
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Gemini => gemini::DEFAULT_PORT,
            Scheme::Gopher => gopher::DEFAULT_PORT,
            Scheme::Finger => finger::DEFAULT_PORT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Scheme::Gemini => "gemini",
            Scheme::Gopher => "gopher",
            Scheme::Finger => "finger",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "gemini" => Some(Scheme::Gemini),
            "gopher" => Some(Scheme::Gopher),
            "finger" => Some(Scheme::Finger),
            _ => None,
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to issue a Fetch for a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub request: Vec<u8>,
}

impl Target {
    /// Build the target for a gemini://, gopher:// or finger:// URL
    pub fn from_url(url: &Url) -> SchemeResult<Self> {
        let scheme = Scheme::from_name(url.scheme())
            .ok_or_else(|| SchemeError::Unsupported(url.scheme().to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| SchemeError::MissingHost(url.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let request = match scheme {
            Scheme::Gemini => gemini::request(url)?,
            Scheme::Gopher => gopher::request_for_url(url)?,
            Scheme::Finger => finger::request_for_url(url)?,
        };

        Ok(Self {
            scheme,
            host,
            port,
            request,
        })
    }
}

/// Decode `%XX` escapes of a URL component
pub(crate) fn percent_decode(input: &str) -> SchemeResult<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| SchemeError::BadEncoding(input.to_string()))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| SchemeError::BadEncoding(input.to_string()))
}
