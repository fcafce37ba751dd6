//! Tests for DevTools endpoint resolution against a fake control endpoint


use provider_bridge::browser::endpoint::{fetch_socket_url, is_reachable, resolve};
use provider_bridge::{BridgeError, BrowserMode, BrowserSettings, Timings};
use std::sync::Mutex;
use std::time::Duration;
use test_server::{TestServer, FAKE_SOCKET_URL, FLAKY_FAILURES};

fn fast_timings(attempts: u32) -> Timings {
    Timings {
        resolve_attempts: attempts,
        resolve_interval: Duration::from_millis(20),
        resolve_request_timeout: Duration::from_millis(500),
        ..Timings::default()
    }
}

fn attach(url: String) -> BrowserSettings {
    BrowserSettings {
        mode: BrowserMode::Attach,
        cdp_url: Some(url),
        ..BrowserSettings::default()
    }
}

#[tokio::test]
async fn test_attach_resolves_socket_url() {
    let server = TestServer::start().await;
    server.wait_ready().await.expect("Test server not ready");

    let messages = Mutex::new(Vec::new());
    let progress = |m: &str| messages.lock().unwrap().push(m.to_string());

    let resolved = resolve(&attach(server.url()), &fast_timings(3), &progress)
        .await
        .expect("Should resolve");

    assert_eq!(resolved.endpoint.socket_url, FAKE_SOCKET_URL);
    assert_eq!(resolved.endpoint.control_url, server.url());
    assert!(resolved.managed.is_none(), "Attached browsers are not owned");
    resolved.release().await.expect("Release is a no-op for attach");

    let messages = messages.lock().unwrap();
    assert!(messages.iter().any(|m| m.starts_with("Connecting to existing Chrome")));
    println!("✅ Resolved {}", FAKE_SOCKET_URL);
}

#[tokio::test]
async fn test_retries_until_endpoint_answers() {
    let server = TestServer::start().await;
    server.wait_ready().await.expect("Test server not ready");

    let control = format!("{}/flaky", server.url());
    let url = fetch_socket_url(&control, &fast_timings(FLAKY_FAILURES as u32 + 2))
        .await
        .expect("Should succeed after retries");

    assert_eq!(url, FAKE_SOCKET_URL);
}

#[tokio::test]
async fn test_attempts_exhausted_is_resolution_timeout() {
    let server = TestServer::start().await;
    server.wait_ready().await.expect("Test server not ready");

    let control = format!("{}/broken", server.url());
    let err = fetch_socket_url(&control, &fast_timings(3))
        .await
        .expect_err("No socket URL should be a resolution timeout");

    assert!(matches!(err, BridgeError::ResolutionTimeout(_)), "got {:?}", err);
    assert!(err.to_string().contains("after 3 attempts"));
    println!("✅ Resolution error: {}", err);
}

#[tokio::test]
async fn test_flaky_endpoint_with_too_few_attempts_fails() {
    let server = TestServer::start().await;
    server.wait_ready().await.expect("Test server not ready");

    let control = format!("{}/flaky", server.url());
    let err = fetch_socket_url(&control, &fast_timings(FLAKY_FAILURES as u32))
        .await
        .expect_err("Should give up before the endpoint recovers");

    assert!(matches!(err, BridgeError::ResolutionTimeout(_)));
}

#[tokio::test]
async fn test_attach_to_missing_browser_is_connection_failure() {
    // Bind then drop a listener to get a port nothing is serving on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let control = format!("http://127.0.0.1:{}", port);
    assert!(!is_reachable(&control, Duration::from_millis(300)).await);

    let progress = |_: &str| {};
    let err = resolve(&attach(control), &fast_timings(2), &progress)
        .await
        .expect_err("Nothing is listening");

    assert!(matches!(err, BridgeError::ConnectionFailed(_)), "got {:?}", err);
    assert!(err.to_string().contains("--remote-debugging-port"));
}
