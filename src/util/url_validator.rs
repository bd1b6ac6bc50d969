use thiserror::Error;
use url::Url;

/// Errors that can occur during base-URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
}

/// Validates a snapshot base URL before it is persisted.
///
/// The cache never fetches anything itself, but every stored base URL is
/// later combined with file names by the download collaborator, so only
/// well-formed http(s) URLs with a host are accepted.
///
/// # Examples
///
/// ```
/// use kiosk::util::validate_base_url;
///
/// let url = validate_base_url("https://feed.example.com/api").unwrap();
/// assert_eq!(url.host_str(), Some("feed.example.com"));
///
/// assert!(validate_base_url("file:///etc/passwd").is_err());
/// assert!(validate_base_url("not a url").is_err());
/// ```
pub fn validate_base_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlValidationError::UnsupportedScheme(other.to_string())),
    }

    if url.host_str().is_none() {
        return Err(UrlValidationError::MissingHost);
    }

    Ok(url)
}
