//! Fetch policies and the responses synthesized when the network is gone.

use http::{header, HeaderValue, StatusCode};
use luxe_net::{Request, RequestDestination, Response};

use crate::config::OfflineConfig;

/// Placeholder served for images that are neither cached nor reachable.
pub const OFFLINE_IMAGE_SVG: &str = concat!(
    r#"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200">"#,
    r##"<rect width="200" height="200" fill="#1a1a1a"/>"##,
    r##"<text x="100" y="100" text-anchor="middle" fill="#666" font-family="Arial">Offline</text>"##,
    "</svg>",
);

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Cache, then network with write-back, then the offline shell.
    Navigation,
    /// Cache, then network without write-back.
    StaticAsset,
    /// Cache, then network with write-back of 200s, then the image placeholder.
    Generic,
}

impl FetchPolicy {
    /// Navigation mode wins over manifest membership.
    pub fn select(request: &Request, config: &OfflineConfig) -> Self {
        if request.is_navigation() {
            FetchPolicy::Navigation
        } else if config.is_same_origin(&request.url)
            && config.static_assets.contains(request.url.path())
        {
            FetchPolicy::StaticAsset
        } else {
            FetchPolicy::Generic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchPolicy::Navigation => "navigation",
            FetchPolicy::StaticAsset => "static",
            FetchPolicy::Generic => "generic",
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    /// The cached offline shell stood in for a failed navigation.
    OfflineShell,
    /// The SVG placeholder stood in for a failed image.
    OfflinePlaceholder,
}

/// Response handed back to the page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchResponse {
    pub fn new(response: Response, source: ResponseSource) -> Self {
        Self { response, source }
    }

    pub fn is_from_cache(&self) -> bool {
        self.source == ResponseSource::Cache || self.source == ResponseSource::OfflineShell
    }
}

/// Only plain 200 responses enter the dynamic partition.
pub fn is_cacheable(response: &Response) -> bool {
    response.status == StatusCode::OK
}

/// Whether a failed request gets the image placeholder.
pub fn wants_placeholder(request: &Request) -> bool {
    request.destination == RequestDestination::Image
}

/// Build the offline image placeholder.
pub fn offline_placeholder() -> Response {
    Response::new(StatusCode::OK, OFFLINE_IMAGE_SVG).with_header(
        header::CONTENT_TYPE,
        HeaderValue::from_static("image/svg+xml"),
    )
}
