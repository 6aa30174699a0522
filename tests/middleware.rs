//! End-to-end behavior of the tower middleware.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::header::CONTENT_LENGTH;
use http::{Request, Response, StatusCode, Uri};
use tokio::sync::Semaphore;
use tower::{service_fn, Layer, ServiceExt};

use s3gate::breaker::{CircuitBreaker, ErrorCode, LimitKey, Metric, ACTION_WRITE};
use s3gate::middleware::{BucketName, CircuitBreakerLayer, RejectionWriter};

const CONFIG: &str = r#"{
    "global": {"enabled": true, "actions": {"Write": 100}},
    "buckets": {"photos": {"enabled": true, "actions": {"Write": 2, "Write:bytes": 1000}}}
}"#;

fn breaker(json: &str) -> Arc<CircuitBreaker> {
    let breaker = CircuitBreaker::new();
    breaker.load_from_bytes(json.as_bytes()).unwrap();
    Arc::new(breaker)
}

fn put(bucket: &str, len: u64) -> Request<String> {
    let mut request = Request::put(format!("/{}/object", bucket))
        .header(CONTENT_LENGTH, len)
        .body(String::new())
        .unwrap();
    request.extensions_mut().insert(BucketName::new(bucket));
    request
}

/// Waits until `key` reaches `expected`, yielding to spawned requests.
async fn wait_for(breaker: &CircuitBreaker, key: &LimitKey, expected: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while breaker.counter_value(key) != Some(expected) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("counter did not reach expected value");
}

#[tokio::test]
async fn admitted_request_reaches_handler_and_releases() {
    let breaker = breaker(CONFIG);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);

    let service = CircuitBreakerLayer::new(Arc::clone(&breaker), ACTION_WRITE).layer(service_fn(
        move |_req: Request<String>| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Response::new("ok".to_string()))
            }
        },
    ));

    let response = service.oneshot(put("photos", 10)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        breaker.counter_value(&LimitKey::bucket("photos", ACTION_WRITE, Metric::Count)),
        Some(0)
    );
}

#[tokio::test]
async fn oversized_request_rejected_without_calling_handler() {
    let breaker = breaker(CONFIG);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);

    let service = CircuitBreakerLayer::new(Arc::clone(&breaker), ACTION_WRITE).layer(service_fn(
        move |_req: Request<String>| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Response::new(String::new()))
            }
        },
    ));

    let response = service.oneshot(put("photos", 5000)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.body().contains("ErrRequestBytesExceed"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The bucket count taken before the bytes check was given back.
    assert_eq!(
        breaker.counter_value(&LimitKey::bucket("photos", ACTION_WRITE, Metric::Count)),
        Some(0)
    );
}

#[tokio::test]
async fn concurrency_limit_applies_while_requests_in_flight() {
    let breaker = breaker(CONFIG);
    let gate = Arc::new(Semaphore::new(0));
    let key = LimitKey::bucket("photos", ACTION_WRITE, Metric::Count);

    let handler_gate = Arc::clone(&gate);
    let service = CircuitBreakerLayer::new(Arc::clone(&breaker), ACTION_WRITE).layer(service_fn(
        move |_req: Request<String>| {
            let gate = Arc::clone(&handler_gate);
            async move {
                gate.acquire().await.unwrap().forget();
                Ok::<_, Infallible>(Response::new("stored".to_string()))
            }
        },
    ));

    let first = tokio::spawn(service.clone().oneshot(put("photos", 1)));
    let second = tokio::spawn(service.clone().oneshot(put("photos", 1)));
    wait_for(&breaker, &key, 2).await;

    let rejected = service.clone().oneshot(put("photos", 1)).await.unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(rejected.body().contains("ErrTooManyRequest"));
    assert_eq!(breaker.counter_value(&key), Some(2));

    // Let one request finish; the next one gets its slot.
    gate.add_permits(1);
    wait_for(&breaker, &key, 1).await;

    let third = tokio::spawn(service.clone().oneshot(put("photos", 1)));
    wait_for(&breaker, &key, 2).await;

    gate.add_permits(2);
    for handle in [first, second, third] {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.body(), "stored");
    }
    assert_eq!(breaker.counter_value(&key), Some(0));
}

#[tokio::test]
async fn disabled_breaker_passes_everything_through() {
    let breaker = breaker(
        r#"{
            "global": {"enabled": false, "actions": {"Write": 0}},
            "buckets": {"photos": {"enabled": true, "actions": {"Write": 0}}}
        }"#,
    );

    let service = CircuitBreakerLayer::new(Arc::clone(&breaker), ACTION_WRITE).layer(service_fn(
        |_req: Request<String>| async { Ok::<_, Infallible>(Response::new("ok".to_string())) },
    ));

    for _ in 0..5 {
        let response = service.clone().oneshot(put("photos", 1 << 30)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(breaker.counter_count(), 0);
}

#[tokio::test]
async fn cancelled_request_releases_capacity() {
    let breaker = breaker(CONFIG);
    let key = LimitKey::bucket("photos", ACTION_WRITE, Metric::Bytes);

    let service = CircuitBreakerLayer::new(Arc::clone(&breaker), ACTION_WRITE).layer(service_fn(
        |_req: Request<String>| async {
            std::future::pending::<()>().await;
            Ok::<_, Infallible>(Response::new(String::new()))
        },
    ));

    let handle = tokio::spawn(service.oneshot(put("photos", 700)));
    wait_for(&breaker, &key, 700).await;

    handle.abort();
    let _ = handle.await;
    assert_eq!(breaker.counter_value(&key), Some(0));
}

#[tokio::test]
async fn request_without_bucket_only_checks_global() {
    let breaker = breaker(
        r#"{
            "global": {"enabled": true, "actions": {"Write": 1}},
            "buckets": {"photos": {"enabled": true, "actions": {"Write": 0}}}
        }"#,
    );

    let service = CircuitBreakerLayer::new(Arc::clone(&breaker), ACTION_WRITE).layer(service_fn(
        |_req: Request<String>| async { Ok::<_, Infallible>(Response::new("ok".to_string())) },
    ));

    let request = Request::put("/").body(String::new()).unwrap();
    let response = service.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[derive(Clone)]
struct PlainWriter;

impl RejectionWriter<String> for PlainWriter {
    fn write_rejection(&self, code: ErrorCode, _uri: &Uri) -> Response<String> {
        let mut response = Response::new(format!("slow down: {}", code));
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        response
    }
}

#[tokio::test]
async fn custom_rejection_writer() {
    let breaker = breaker(r#"{"global": {"enabled": true, "actions": {"Write": 0}}}"#);

    let layer = CircuitBreakerLayer::new(Arc::clone(&breaker), ACTION_WRITE).with_writer(PlainWriter);
    assert_eq!(layer.action(), ACTION_WRITE);

    let service = layer.layer(service_fn(|_req: Request<String>| async {
        Ok::<_, Infallible>(Response::new("ok".to_string()))
    }));

    let response = service.oneshot(put("photos", 0)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body(), "slow down: Too many simultaneous requests");
}
