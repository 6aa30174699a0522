//! Tower middleware that puts the circuit breaker in front of a handler.
//!
//! ```rust,ignore
//! let breaker = Arc::new(CircuitBreaker::initialize(&store).await);
//! let put_object = CircuitBreakerLayer::new(Arc::clone(&breaker), ACTION_WRITE)
//!     .layer(put_object_handler);
//! ```
//!
//! The router is expected to insert a [`BucketName`] extension before the
//! request reaches the layer. Requests without one are only checked against
//! global limits.

use futures::future::BoxFuture;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Request, Response, Uri};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::debug;

use crate::breaker::{CircuitBreaker, ErrorCode};

/// The bucket a request targets, as resolved by the router.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketName(pub String);

impl BucketName {
    /// Wrap a bucket name resolved by the router.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// First segment of a path-style S3 URL (`/bucket/key...`).
    pub fn from_path(path: &str) -> Option<Self> {
        path.trim_start_matches('/')
            .split('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(Self::new)
    }

    /// The bucket name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Turns a rejection into a protocol response.
pub trait RejectionWriter<B>: Send + Sync {
    fn write_rejection(&self, code: ErrorCode, uri: &Uri) -> Response<B>;
}

/// Writes S3-style XML error bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct S3ErrorWriter;

impl<B: From<String>> RejectionWriter<B> for S3ErrorWriter {
    fn write_rejection(&self, code: ErrorCode, uri: &Uri) -> Response<B> {
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <Error><Code>{}</Code><Message>{}</Message><Resource>{}</Resource><RequestId></RequestId></Error>",
            code.code(),
            code.description(),
            escape_xml(uri.path()),
        );

        let mut response = Response::new(B::from(body));
        *response.status_mut() = code.status();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
        response
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Declared request body size; missing or malformed headers count as zero.
fn declared_content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

/// Guards one action with a shared [`CircuitBreaker`].
pub struct CircuitBreakerLayer<W = S3ErrorWriter> {
    breaker: Arc<CircuitBreaker>,
    action: Arc<str>,
    writer: Arc<W>,
}

impl CircuitBreakerLayer {
    /// Guard `action` with `breaker`, writing S3 XML errors on rejection.
    pub fn new(breaker: Arc<CircuitBreaker>, action: impl Into<String>) -> Self {
        Self {
            breaker,
            action: Arc::from(action.into()),
            writer: Arc::new(S3ErrorWriter),
        }
    }
}

impl<W> CircuitBreakerLayer<W> {
    /// Use a different response writer for rejections.
    pub fn with_writer<W2>(self, writer: W2) -> CircuitBreakerLayer<W2> {
        CircuitBreakerLayer {
            breaker: self.breaker,
            action: self.action,
            writer: Arc::new(writer),
        }
    }

    /// The action this layer guards.
    pub fn action(&self) -> &str {
        &self.action
    }
}

impl<W> Clone for CircuitBreakerLayer<W> {
    fn clone(&self) -> Self {
        Self {
            breaker: Arc::clone(&self.breaker),
            action: Arc::clone(&self.action),
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<S, W> Layer<S> for CircuitBreakerLayer<W> {
    type Service = CircuitBreakerService<S, W>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: Arc::clone(&self.breaker),
            action: Arc::clone(&self.action),
            writer: Arc::clone(&self.writer),
        }
    }
}

/// A handler wrapped by [`CircuitBreakerLayer`].
pub struct CircuitBreakerService<S, W = S3ErrorWriter> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
    action: Arc<str>,
    writer: Arc<W>,
}

impl<S: Clone, W> Clone for CircuitBreakerService<S, W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            breaker: Arc::clone(&self.breaker),
            action: Arc::clone(&self.action),
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<S, W, ReqBody, ResBody> Service<Request<ReqBody>> for CircuitBreakerService<S, W>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    W: RejectionWriter<ResBody>,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        if !self.breaker.is_enabled() {
            return Box::pin(self.inner.call(request));
        }

        let content_length = declared_content_length(request.headers());
        let bucket = request.extensions().get::<BucketName>().map(BucketName::as_str);

        match self.breaker.admit(bucket, &self.action, content_length) {
            Ok(admission) => {
                let future = self.inner.call(request);
                Box::pin(async move {
                    let response = future.await;
                    admission.release();
                    response
                })
            }
            Err(code) => {
                debug!(
                    action = %self.action,
                    bucket = ?request.extensions().get::<BucketName>(),
                    content_length,
                    code = code.code(),
                    "Request rejected by circuit breaker"
                );
                let response = self.writer.write_rejection(code, request.uri());
                Box::pin(futures::future::ready(Ok(response)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_from_path() {
        assert_eq!(BucketName::from_path("/photos/a/b.jpg"), Some(BucketName::new("photos")));
        assert_eq!(BucketName::from_path("/photos"), Some(BucketName::new("photos")));
        assert_eq!(BucketName::from_path("/"), None);
        assert_eq!(BucketName::from_path(""), None);
    }

    #[test]
    fn test_declared_content_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(declared_content_length(&headers), 0);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1024"));
        assert_eq!(declared_content_length(&headers), 1024);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("-5"));
        assert_eq!(declared_content_length(&headers), 0);
    }

    #[test]
    fn test_s3_error_body() {
        let uri = Uri::from_static("/photos/a&b.jpg");
        let response: Response<String> =
            S3ErrorWriter.write_rejection(ErrorCode::TooManyRequests, &uri);

        assert_eq!(response.status(), http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/xml");
        assert!(response.body().contains("<Code>ErrTooManyRequest</Code>"));
        assert!(response.body().contains("<Resource>/photos/a&amp;b.jpg</Resource>"));
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("a&b<c>\"'"), "a&amp;b&lt;c&gt;&quot;&apos;");
    }

    #[test]
    fn test_rejection_resolves_on_first_poll() {
        let breaker = CircuitBreaker::new();
        breaker
            .load_from_bytes(br#"{"global": {"enabled": true, "actions": {"Write": 0}}}"#)
            .unwrap();

        let mut service = CircuitBreakerLayer::new(Arc::new(breaker), "Write").layer(
            tower::service_fn(|_req: Request<String>| async {
                Ok::<_, std::convert::Infallible>(Response::new(String::new()))
            }),
        );

        let mut future = tokio_test::task::spawn(service.call(Request::new(String::new())));
        let response = tokio_test::assert_ready_ok!(future.poll());
        assert_eq!(response.status(), http::StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_layer_reports_action() {
        let layer = CircuitBreakerLayer::new(Arc::new(CircuitBreaker::new()), "Write");
        assert_eq!(layer.action(), "Write");
    }
}
