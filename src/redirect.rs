//! Resolution of 3xx targets back into request options.

use http::header::LOCATION;
use http::{HeaderMap, StatusCode};

use crate::request::RequestOptions;

/// Where a redirect points, in the two forms the pipeline follows.
///
/// Any other `Location` shape (protocol-relative, opaque, unparseable) is not
/// followed; the 3xx response is handed to the caller unchanged.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RedirectTarget {
    Absolute {
        secure: bool,
        hostname: String,
        port: Option<u16>,
        path: String,
    },
    SameHost {
        path: String,
    },
}

pub(crate) fn resolve_target(status: StatusCode, headers: &HeaderMap) -> Option<RedirectTarget> {
    if !status.is_redirection() {
        return None;
    }
    let location = headers.get(LOCATION)?.to_str().ok()?;

    if location.starts_with("http://") || location.starts_with("https://") {
        let url = url::Url::parse(location).ok()?;
        let hostname = url.host_str()?.to_owned();
        let mut path = url.path().to_owned();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        return Some(RedirectTarget::Absolute {
            secure: url.scheme() == "https",
            hostname,
            port: url.port(),
            path,
        });
    }
    if location.starts_with('/') {
        return Some(RedirectTarget::SameHost {
            path: location.to_owned(),
        });
    }
    None
}

/// Rewrites `options` in place so the target re-enters the whole pipeline as
/// a fresh destination with its own buckets and retry budget.
pub(crate) fn apply_target(options: &mut RequestOptions, target: RedirectTarget) {
    match target {
        RedirectTarget::Absolute {
            secure,
            hostname,
            port,
            path,
        } => {
            options.secure = secure;
            options.hostname = hostname;
            options.port = port;
            options.path = path;
        }
        RedirectTarget::SameHost { path } => {
            options.path = path;
        }
    }
}

#[cfg(test)]
mod tests {
    use http::header::{HeaderValue, LOCATION};
    use http::{HeaderMap, StatusCode};

    use super::{RedirectTarget, apply_target, resolve_target};
    use crate::request::RequestOptions;

    fn headers_with_location(location: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static(location));
        headers
    }

    #[test]
    fn absolute_location_carries_scheme_host_port_and_query() {
        let headers = headers_with_location("http://other.example.com:8080/v2/items?page=2");
        let target = resolve_target(StatusCode::FOUND, &headers).expect("absolute target");
        assert_eq!(
            target,
            RedirectTarget::Absolute {
                secure: false,
                hostname: "other.example.com".to_owned(),
                port: Some(8080),
                path: "/v2/items?page=2".to_owned(),
            }
        );
    }

    #[test]
    fn rooted_location_stays_on_the_original_host() {
        let headers = headers_with_location("/moved/here");
        let target = resolve_target(StatusCode::MOVED_PERMANENTLY, &headers).expect("same host");
        assert_eq!(
            target,
            RedirectTarget::SameHost {
                path: "/moved/here".to_owned(),
            }
        );
    }

    #[test]
    fn opaque_and_relative_locations_are_not_followed() {
        for location in ["ftp://files.example.com/a", "relative/path"] {
            let mut headers = HeaderMap::new();
            headers.insert(LOCATION, HeaderValue::from_str(location).expect("header"));
            assert_eq!(resolve_target(StatusCode::FOUND, &headers), None);
        }
    }

    #[test]
    fn non_redirect_statuses_resolve_to_nothing() {
        let headers = headers_with_location("/elsewhere");
        assert_eq!(resolve_target(StatusCode::OK, &headers), None);
        assert_eq!(resolve_target(StatusCode::NOT_FOUND, &headers), None);
    }

    #[test]
    fn missing_location_resolves_to_nothing() {
        assert_eq!(resolve_target(StatusCode::FOUND, &HeaderMap::new()), None);
    }

    #[test]
    fn applying_an_absolute_target_rewrites_the_destination() {
        let mut options = RequestOptions::get("api.example.com").path("/v1/start");
        apply_target(
            &mut options,
            RedirectTarget::Absolute {
                secure: false,
                hostname: "other.example.com".to_owned(),
                port: Some(8080),
                path: "/landing".to_owned(),
            },
        );
        assert_eq!(options.uri_text(), "http://other.example.com:8080/landing");
    }
}
