use url::Url;

/// Resolves a link href against the page it appeared on
///
/// Returns `None` for links that cannot lead to another page:
/// - empty or fragment-only hrefs
/// - `javascript:`, `mailto:`, `tel:` and `data:` schemes
/// - anything that is not HTTP(S) after resolution
pub fn resolve_link(href: &str, base_url: &Url) -> Option<Url> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lower = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return None;
    }

    let absolute = base_url.join(href).ok()?;
    match absolute.scheme() {
        "http" | "https" => Some(absolute),
        _ => None,
    }
}

/// Returns the origin (`scheme://host[:port]`) a robots policy applies to
///
/// # Examples
///
/// ```
/// use url::Url;
/// use stage_harvest::url::origin_of;
///
/// let url = Url::parse("https://Jobs.Example.com:8443/a?b=c").unwrap();
/// assert_eq!(origin_of(&url), Some("https://jobs.example.com:8443".to_string()));
/// ```
pub fn origin_of(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}
