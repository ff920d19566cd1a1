//! Gopher requests
//!
//! There is no reply header; the body starts right after the request is
//! sent. Menus are line oriented but interpreting them is up to the UI.

use url::Url;

use super::{percent_decode, SchemeResult};

pub const DEFAULT_PORT: u16 = 70;

/// Item type used for full-text search servers
pub const SEARCH_ITEM: char = '7';

/// Serialize a request for `selector`, with an optional search string
pub fn request(selector: &str, query: Option<&str>) -> Vec<u8> {
    let mut out = Vec::with_capacity(selector.len() + 3);
    out.extend_from_slice(selector.as_bytes());
    if let Some(query) = query {
        out.push(b'\t');
        out.extend_from_slice(query.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Split a gopher URL path into its item type and selector
///
/// `/1/docs` is a menu (`1`) with selector `/docs`; an empty path is the
/// root menu.
pub fn item_and_selector(url: &Url) -> SchemeResult<(char, String)> {
    let path = percent_decode(url.path())?;
    let mut chars = path.trim_start_matches('/').chars();
    match chars.next() {
        Some(item) => Ok((item, chars.as_str().to_string())),
        None => Ok(('1', String::new())),
    }
}

/// Build the wire request for a gopher URL
///
/// The search string comes from an encoded tab in the path or from the URL
/// query, whichever is present.
pub fn request_for_url(url: &Url) -> SchemeResult<Vec<u8>> {
    let (item, selector) = item_and_selector(url)?;

    let (selector, search) = match selector.split_once('\t') {
        Some((selector, search)) => (selector.to_string(), Some(search.to_string())),
        None => (selector, None),
    };
    let search = match (search, url.query()) {
        (Some(search), _) => Some(search),
        (None, Some(query)) => Some(percent_decode(query)?),
        (None, None) => None,
    };

    if search.is_some() && item != SEARCH_ITEM {
        tracing::debug!("Search string on non-search item '{}'", item);
    }

    Ok(request(&selector, search.as_deref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_selector() {
        assert_eq!(request("/about", None), b"/about\r\n");
        assert_eq!(request("", None), b"\r\n");
    }

    #[test]
    fn test_search_selector() {
        assert_eq!(request("/veronica", Some("rust")), b"/veronica\trust\r\n");
    }

    #[test]
    fn test_url_root_menu() {
        let url = Url::parse("gopher://example.org").unwrap();
        assert_eq!(item_and_selector(&url).unwrap(), ('1', String::new()));
        assert_eq!(request_for_url(&url).unwrap(), b"\r\n");
    }

    #[test]
    fn test_url_item_type_is_stripped() {
        let url = Url::parse("gopher://example.org/0/docs/readme.txt").unwrap();
        assert_eq!(
            item_and_selector(&url).unwrap(),
            ('0', "/docs/readme.txt".to_string())
        );
        assert_eq!(request_for_url(&url).unwrap(), b"/docs/readme.txt\r\n");
    }

    #[test]
    fn test_url_search_via_query() {
        let url = Url::parse("gopher://example.org/7/search?hello%20world").unwrap();
        assert_eq!(request_for_url(&url).unwrap(), b"/search\thello world\r\n");
    }

    #[test]
    fn test_url_search_via_encoded_tab() {
        let url = Url::parse("gopher://example.org/7/search%09rust").unwrap();
        assert_eq!(request_for_url(&url).unwrap(), b"/search\trust\r\n");
    }
}
