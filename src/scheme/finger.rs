//! Finger requests

use url::Url;

use super::{percent_decode, SchemeResult};

pub const DEFAULT_PORT: u16 = 79;

/// Serialize a query for `user`; an empty user asks for the default listing
pub fn request(user: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(user.len() + 2);
    out.extend_from_slice(user.as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

/// Build the wire request for `finger://host/user`
///
/// The URL userinfo (`finger://user@host`) is honoured when the path is
/// empty.
pub fn request_for_url(url: &Url) -> SchemeResult<Vec<u8>> {
    let path = percent_decode(url.path().trim_start_matches('/'))?;
    let user = if path.is_empty() {
        percent_decode(url.username())?
    } else {
        path
    };
    Ok(request(&user))
}
