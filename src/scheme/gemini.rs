//! Gemini requests and reply headers
//!
//! A request is the absolute URL followed by CRLF. A reply starts with
//! `<two digit status> <meta>\r\n`; everything after that line is body.

use thiserror::Error;
use url::Url;

use super::{SchemeError, SchemeResult};

pub const DEFAULT_PORT: u16 = 1965;

/// Longest URL a request may carry
pub const MAX_URL_LEN: usize = 1024;

/// A header line (CRLF excluded) must be shorter than this
pub const MAX_HEADER_LEN: usize = 1024;

/// Header parse failures, rendered verbatim to the consumer
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("reply too long")]
    TooLong,

    #[error("invalid reply")]
    Truncated,

    #[error("malformed reply")]
    Malformed,
}

/// Parsed reply header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub status: u8,
    pub meta: String,
}

/// Status classes, keyed by the first digit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Input,
    Success,
    Redirect,
    TemporaryFailure,
    PermanentFailure,
    ClientCertificate,
    Unknown,
}

impl Header {
    pub fn class(&self) -> StatusClass {
        match self.status / 10 {
            1 => StatusClass::Input,
            2 => StatusClass::Success,
            3 => StatusClass::Redirect,
            4 => StatusClass::TemporaryFailure,
            5 => StatusClass::PermanentFailure,
            6 => StatusClass::ClientCertificate,
            _ => StatusClass::Unknown,
        }
    }

    /// Only success replies carry a body
    pub fn has_body(&self) -> bool {
        self.class() == StatusClass::Success
    }
}

/// Serialize a request for `url`
pub fn request(url: &Url) -> SchemeResult<Vec<u8>> {
    let mut url = url.clone();
    url.set_fragment(None);
    let text = url.as_str();
    if text.len() > MAX_URL_LEN {
        return Err(SchemeError::UrlTooLong(text.len(), MAX_URL_LEN));
    }

    let mut out = Vec::with_capacity(text.len() + 2);
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(b"\r\n");
    Ok(out)
}

/// Look for a complete header at the front of `buf`
///
/// Returns the header and the number of bytes it occupies (CRLF included),
/// `Ok(None)` when more bytes are needed, or the reason the buffer can never
/// hold a valid header.
pub fn scan_header(buf: &[u8]) -> Result<Option<(Header, usize)>, HeaderError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(end) if end >= MAX_HEADER_LEN => Err(HeaderError::TooLong),
        Some(end) => parse_header(&buf[..end]).map(|h| Some((h, end + 2))),
        None => {
            // A trailing CR at the limit may still be completed by an LF
            let limit_hit = buf.len() > MAX_HEADER_LEN
                || (buf.len() == MAX_HEADER_LEN && buf[MAX_HEADER_LEN - 1] != b'\r');
            if limit_hit {
                Err(HeaderError::TooLong)
            } else {
                Ok(None)
            }
        }
    }
}

/// Parse a header line without its CRLF
pub fn parse_header(line: &[u8]) -> Result<Header, HeaderError> {
    if line.len() < 3 {
        return Err(HeaderError::Malformed);
    }
    let (digits, rest) = line.split_at(2);
    if !digits.iter().all(u8::is_ascii_digit) || rest[0] != b' ' {
        return Err(HeaderError::Malformed);
    }

    let status = (digits[0] - b'0') * 10 + (digits[1] - b'0');
    let meta = std::str::from_utf8(&rest[1..])
        .map_err(|_| HeaderError::Malformed)?
        .to_string();

    Ok(Header { status, meta })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_strips_fragment() {
        let url = Url::parse("gemini://example.org/page#section").unwrap();
        assert_eq!(request(&url).unwrap(), b"gemini://example.org/page\r\n");
    }

    #[test]
    fn test_request_too_long() {
        let path = "a".repeat(MAX_URL_LEN);
        let url = Url::parse(&format!("gemini://example.org/{}", path)).unwrap();
        assert!(matches!(request(&url), Err(SchemeError::UrlTooLong(_, _))));
    }

    #[test]
    fn test_parse_success_header() {
        let (header, used) = scan_header(b"20 text/gemini\r\n").unwrap().unwrap();
        assert_eq!(header.status, 20);
        assert_eq!(header.meta, "text/gemini");
        assert_eq!(used, 16);
        assert!(header.has_body());
    }

    #[test]
    fn test_parse_failure_header() {
        let (header, _) = scan_header(b"51 not found\r\n").unwrap().unwrap();
        assert_eq!(header.status, 51);
        assert_eq!(header.class(), StatusClass::PermanentFailure);
        assert!(!header.has_body());
    }

    #[test]
    fn test_header_leaves_body_bytes() {
        let reply = b"20 text/plain\r\nhello";
        let (_, used) = scan_header(reply).unwrap().unwrap();
        assert_eq!(&reply[used..], b"hello");
    }

    #[test]
    fn test_incomplete_header() {
        assert_eq!(scan_header(b"20 text/gem"), Ok(None));
        assert_eq!(scan_header(b""), Ok(None));
    }

    #[test]
    fn test_malformed_headers() {
        assert_eq!(scan_header(b"2x ok\r\n"), Err(HeaderError::Malformed));
        assert_eq!(scan_header(b"20text/gemini\r\n"), Err(HeaderError::Malformed));
        assert_eq!(scan_header(b"20\r\n"), Err(HeaderError::Malformed));
        assert_eq!(parse_header(b"20 \xff"), Err(HeaderError::Malformed));
    }

    #[test]
    fn test_empty_meta_is_allowed() {
        let header = parse_header(b"30 ").unwrap();
        assert_eq!(header.status, 30);
        assert_eq!(header.meta, "");
    }

    #[test]
    fn test_header_length_boundary() {
        let mut line = b"20 ".to_vec();
        line.resize(MAX_HEADER_LEN, b'x');
        assert_eq!(scan_header(&line), Err(HeaderError::TooLong));

        let mut ok = b"20 ".to_vec();
        ok.resize(MAX_HEADER_LEN - 1, b'x');
        ok.extend_from_slice(b"\r\n");
        let (header, used) = scan_header(&ok).unwrap().unwrap();
        assert_eq!(header.meta.len(), MAX_HEADER_LEN - 4);
        assert_eq!(used, MAX_HEADER_LEN + 1);
    }

    #[test]
    fn test_cr_at_limit_waits_for_lf() {
        let mut partial = b"20 ".to_vec();
        partial.resize(MAX_HEADER_LEN - 1, b'x');
        partial.push(b'\r');
        assert_eq!(scan_header(&partial), Ok(None));
    }
}
