use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;

use crate::FloodgateResult;
use crate::error::Error;
use crate::util::{parse_header_name, parse_header_value};

/// One logical request against a destination host.
///
/// The destination is addressed as `hostname` + `path` rather than a full
/// URL because the rate limiter buckets on exactly those two components.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub(crate) method: Method,
    pub(crate) hostname: String,
    pub(crate) port: Option<u16>,
    pub(crate) path: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Bytes>,
    pub(crate) secure: bool,
    pub(crate) attempt_timeout: Option<Duration>,
    pub(crate) fallback_limit: Option<u32>,
}

impl RequestOptions {
    pub fn new(method: Method, hostname: impl Into<String>) -> Self {
        Self {
            method,
            hostname: hostname.into(),
            port: None,
            path: "/".to_owned(),
            headers: HeaderMap::new(),
            body: None,
            secure: true,
            attempt_timeout: None,
            fallback_limit: None,
        }
    }

    pub fn get(hostname: impl Into<String>) -> Self {
        Self::new(Method::GET, hostname)
    }

    pub fn post(hostname: impl Into<String>) -> Self {
        Self::new(Method::POST, hostname)
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Plain-http transport. Only for destinations that carry no credentials;
    /// an authorization header over an insecure transport fails validation.
    pub fn insecure(mut self) -> Self {
        self.secure = false;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> FloodgateResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// JSON body; stamps `content-type: application/json`.
    pub fn json<T: Serialize>(mut self, body: &T) -> FloodgateResult<Self> {
        let serialized =
            serde_json::to_vec(body).map_err(|source| Error::SerializeJson { source })?;
        self.body = Some(Bytes::from(serialized));
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    /// Plain-text body; stamps `content-type: text/plain`.
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(Bytes::from(body.into()));
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        self
    }

    /// Raw body with an explicit content type.
    pub fn body(mut self, body: Bytes, content_type: HeaderValue) -> Self {
        self.body = Some(body);
        self.headers.insert(CONTENT_TYPE, content_type);
        self
    }

    /// Per-attempt wall-clock timeout override (client default: 10s).
    pub fn attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = Some(attempt_timeout.max(Duration::from_millis(1)));
        self
    }

    /// Capacity for the fabricated window used when this destination never
    /// advertises rate-limit headers (client default: 100 per second).
    pub fn fallback_limit(mut self, fallback_limit: u32) -> Self {
        self.fallback_limit = Some(fallback_limit.max(1));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn request_path(&self) -> &str {
        &self.path
    }

    pub(crate) fn validate(&self) -> FloodgateResult<()> {
        if self.hostname.is_empty() {
            return Err(Error::MissingHostname);
        }
        if !self.path.starts_with('/') {
            return Err(Error::InvalidPath {
                path: self.path.clone(),
            });
        }
        if self.body.is_some() && !self.headers.contains_key(CONTENT_TYPE) {
            return Err(Error::MissingContentType);
        }
        if self.headers.contains_key(AUTHORIZATION) && !self.secure {
            return Err(Error::InsecureAuthorization);
        }
        Ok(())
    }

    pub(crate) fn uri_text(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        match self.port {
            Some(port) => format!("{scheme}://{}:{port}{}", self.hostname, self.path),
            None => format!("{scheme}://{}{}", self.hostname, self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use http::Method;
    use http::header::{AUTHORIZATION, HeaderValue};

    use super::RequestOptions;
    use crate::error::Error;

    #[test]
    fn defaults_are_secure_get_on_root() {
        let options = RequestOptions::get("api.example.com");
        assert_eq!(options.method, Method::GET);
        assert_eq!(options.path, "/");
        assert!(options.secure);
        assert!(options.validate().is_ok());
        assert_eq!(options.uri_text(), "https://api.example.com/");
    }

    #[test]
    fn explicit_port_lands_in_the_uri() {
        let options = RequestOptions::get("127.0.0.1").port(8080).insecure();
        assert_eq!(options.uri_text(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn path_must_be_rooted() {
        let options = RequestOptions::get("api.example.com").path("users");
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidPath { path }) if path == "users"
        ));
    }

    #[test]
    fn body_without_content_type_is_rejected() {
        let mut options = RequestOptions::post("api.example.com");
        options.body = Some(bytes::Bytes::from_static(b"raw"));
        assert!(matches!(
            options.validate(),
            Err(Error::MissingContentType)
        ));
    }

    #[test]
    fn authorization_requires_secure_transport() {
        let options = RequestOptions::get("api.example.com")
            .header(AUTHORIZATION, HeaderValue::from_static("Bearer token"))
            .insecure();
        assert!(matches!(
            options.validate(),
            Err(Error::InsecureAuthorization)
        ));
    }

    #[test]
    fn json_body_stamps_content_type() {
        let options = RequestOptions::post("api.example.com")
            .json(&serde_json::json!({ "name": "demo" }))
            .expect("serializable body");
        assert_eq!(
            options.headers.get(http::header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
        assert!(options.validate().is_ok());
    }
}
