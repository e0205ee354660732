use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur while validating a calendar source URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http, https or webcal.
    #[error("Unsupported scheme: {0} (only http/https/webcal allowed)")]
    UnsupportedScheme(String),
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Validates a calendar source URL and returns the URL to request.
///
/// `webcal://` subscription links are rewritten to `https://`. Unless
/// `allow_private_hosts` is set, localhost and private address ranges
/// (RFC 1918, link-local, unique local IPv6) are rejected so a feed list
/// cannot be used to probe the local network.
///
/// # Examples
///
/// ```
/// use calwindow::util::validate_source_url;
///
/// let url = validate_source_url("webcal://example.com/cal.ics", false).unwrap();
/// assert_eq!(url.scheme(), "https");
///
/// assert!(validate_source_url("http://192.168.1.1/cal.ics", false).is_err());
/// assert!(validate_source_url("http://192.168.1.1/cal.ics", true).is_ok());
/// assert!(validate_source_url("file:///etc/passwd", true).is_err());
/// ```
pub fn validate_source_url(url_str: &str, allow_private_hosts: bool) -> Result<Url, UrlValidationError> {
    let trimmed = url_str.trim();
    let rewritten;
    let url_str = match trimmed.get(..9) {
        Some(prefix) if prefix.eq_ignore_ascii_case("webcal://") => {
            rewritten = format!("https://{}", &trimmed[9..]);
            rewritten.as_str()
        }
        _ => trimmed,
    };

    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if allow_private_hosts {
        return Ok(url);
    }

    if let Some(host) = url.host_str() {
        if host == "localhost" {
            return Err(UrlValidationError::Localhost);
        }

        // Strip brackets from IPv6 addresses for parsing
        let host_for_parse = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
            if ip.is_loopback() {
                return Err(UrlValidationError::Localhost);
            }
            if is_private_ip(&ip) {
                return Err(UrlValidationError::PrivateIp(ip.to_string()));
            }
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}
