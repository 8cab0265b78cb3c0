//! Single-attempt request execution over a pooled hyper client.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::Error;
use crate::request::RequestOptions;
use crate::response::Response;
use crate::util::ensure_accept_encoding;

pub(crate) const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

type HttpsConnector = hyper_rustls::HttpsConnector<HttpConnector>;

pub(crate) struct RequestExecutor {
    transport: HyperClient<HttpsConnector, Full<Bytes>>,
    attempt_timeout: Duration,
    max_response_body_bytes: usize,
}

impl RequestExecutor {
    pub(crate) fn new(
        attempt_timeout: Duration,
        max_response_body_bytes: usize,
    ) -> Result<Self, Error> {
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| Error::TlsInit {
                message: source.to_string(),
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let transport = HyperClient::builder(TokioExecutor::new()).build(https);
        Ok(Self {
            transport,
            attempt_timeout,
            max_response_body_bytes,
        })
    }

    /// One attempt: build, send, read, decode. A network fault, the attempt
    /// timeout, or an undecodable body rejects; any HTTP status resolves.
    pub(crate) async fn execute_once(&self, options: &RequestOptions) -> Result<Response, Error> {
        let uri_text = options.uri_text();
        let uri: Uri = uri_text.parse().map_err(|_| Error::InvalidUri {
            uri: uri_text.clone(),
        })?;
        let mut headers = options.headers.clone();
        ensure_accept_encoding(&mut headers);

        let mut request = Request::new(Full::new(options.body.clone().unwrap_or_default()));
        *request.method_mut() = options.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;

        let attempt_timeout = options.attempt_timeout.unwrap_or(self.attempt_timeout);
        let started = Instant::now();
        let outcome = timeout(attempt_timeout, async {
            let response =
                self.transport
                    .request(request)
                    .await
                    .map_err(|source| Error::Transport {
                        method: options.method.clone(),
                        uri: uri_text.clone(),
                        source: Box::new(source),
                    })?;
            let (parts, body) = response.into_parts();
            let collected = body.collect().await.map_err(|source| Error::ReadBody {
                source: Box::new(source),
            })?;
            Ok::<_, Error>((parts.status, parts.headers, collected.to_bytes()))
        })
        .await;

        let (status, mut headers, raw_body) = match outcome {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(error)) => {
                warn!(method = %options.method, uri = %uri_text, error = %error, "http request failed");
                return Err(error);
            }
            Err(_) => {
                warn!(
                    method = %options.method,
                    uri = %uri_text,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "http request timed out"
                );
                return Err(Error::Timeout {
                    timeout_ms: attempt_timeout.as_millis(),
                    method: options.method.clone(),
                    uri: uri_text,
                });
            }
        };

        if raw_body.len() > self.max_response_body_bytes {
            return Err(Error::ResponseBodyTooLarge {
                limit_bytes: self.max_response_body_bytes,
                actual_bytes: raw_body.len(),
            });
        }
        let body = decode_gzip_body(raw_body, &mut headers, self.max_response_body_bytes)?;
        debug!(
            method = %options.method,
            uri = %uri_text,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "http request completed"
        );
        Ok(Response::new(status, headers, body))
    }
}

/// Gunzips the body when the response declares it, dropping the then-stale
/// encoding and length headers. Other encodings pass through untouched.
fn decode_gzip_body(
    body: Bytes,
    headers: &mut HeaderMap,
    max_bytes: usize,
) -> Result<Bytes, Error> {
    let is_gzip = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|encoding| encoding.trim().eq_ignore_ascii_case("gzip"));
    if !is_gzip {
        return Ok(body);
    }

    let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
    let decoded = read_to_end_limited(&mut decoder, max_bytes)?;
    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
    Ok(Bytes::from(decoded))
}

fn read_to_end_limited<R: std::io::Read>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Vec<u8>, Error> {
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; 8 * 1024];
    loop {
        let read = reader
            .read(&mut chunk)
            .map_err(|error| Error::DecodeContentEncoding {
                encoding: "gzip".to_owned(),
                message: error.to_string(),
            })?;
        if read == 0 {
            break;
        }
        let next_size = decoded.len().saturating_add(read);
        if next_size > max_bytes {
            return Err(Error::ResponseBodyTooLarge {
                limit_bytes: max_bytes,
                actual_bytes: next_size,
            });
        }
        decoded.extend_from_slice(&chunk[..read]);
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bytes::Bytes;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use http::HeaderMap;
    use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, HeaderValue};

    use super::decode_gzip_body;
    use crate::error::Error;

    fn gzip(plaintext: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(plaintext).expect("encode fixture");
        Bytes::from(encoder.finish().expect("finish fixture"))
    }

    #[test]
    fn gzip_bodies_round_trip_to_the_plaintext() {
        let plaintext = b"{\"puuid\":\"abc\",\"gameName\":\"demo\"}";
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("53"));

        let decoded =
            decode_gzip_body(gzip(plaintext), &mut headers, 1024).expect("well-formed stream");
        assert_eq!(decoded.as_ref(), plaintext);
        assert!(headers.get(CONTENT_ENCODING).is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn unencoded_bodies_pass_through() {
        let mut headers = HeaderMap::new();
        let body = Bytes::from_static(b"plain");
        let decoded = decode_gzip_body(body.clone(), &mut headers, 1024).expect("no decoding");
        assert_eq!(decoded, body);
    }

    #[test]
    fn corrupt_gzip_streams_reject() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let error = decode_gzip_body(Bytes::from_static(b"not gzip"), &mut headers, 1024)
            .expect_err("corrupt stream");
        assert!(matches!(error, Error::DecodeContentEncoding { .. }));
    }

    #[test]
    fn decoded_bodies_over_the_ceiling_reject() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let error = decode_gzip_body(gzip(&[0_u8; 4096]), &mut headers, 64)
            .expect_err("oversized body");
        assert!(matches!(error, Error::ResponseBodyTooLarge { .. }));
    }
}
