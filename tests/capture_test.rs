//! Credential capture against a scripted browser session

mod fake_session;

use fake_session::FakeSession;
use provider_bridge::{
    capture, BridgeError, CapturePolicy, Cookie, CredentialBundle, SessionEvent, Timings,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn fast_timings() -> Timings {
    Timings {
        capture_deadline: Duration::from_secs(5),
        cookie_poll_interval: Duration::from_millis(50),
        ..Timings::default()
    }
}

fn deepseek_cookies() -> Vec<Cookie> {
    vec![
        Cookie::new("d_id", "x", ".deepseek.com"),
        Cookie::new("smidV2", "s1", ".deepseek.com"),
        Cookie::new("intercom-id", "i1", ".deepseek.com"),
        Cookie::new("cf_clearance", "c1", ".deepseek.com"),
    ]
}

#[tokio::test]
async fn test_deepseek_token_then_cookies_captured() {
    let session = Arc::new(FakeSession::new("about:blank"));
    let policy = CapturePolicy::deepseek();
    let timings = fast_timings();

    let script = session.clone();
    tokio::spawn(async move {
        script.wait_subscribed().await;
        script
            .emit(SessionEvent::Response {
                url: "https://chat.deepseek.com/api/v0/users/current".to_string(),
                status: 200,
                body: Some(r#"{"data":{"biz_data":{"token":"T1"}}}"#.to_string()),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        script.set_cookies_now(deepseek_cookies());
    });

    let messages = Mutex::new(Vec::new());
    let progress = |m: &str| messages.lock().unwrap().push(m.to_string());

    let started = Instant::now();
    let bundle = capture(session.as_ref(), &policy, &timings, &progress)
        .await
        .expect("Capture should succeed");

    match &bundle {
        CredentialBundle::Bearer {
            cookie,
            bearer,
            user_agent,
        } => {
            assert_eq!(bearer, "T1");
            assert!(cookie.contains("d_id=x"), "cookie was {}", cookie);
            assert_eq!(user_agent, "Mozilla/5.0 (FakeSession)");
        }
        other => panic!("expected bearer bundle, got {:?}", other),
    }
    assert!(started.elapsed() < timings.capture_deadline);
    assert_eq!(session.navigations(), vec!["https://chat.deepseek.com".to_string()]);

    let messages = messages.lock().unwrap();
    assert!(messages[0].starts_with("Please login to DeepSeek"));
    assert_eq!(messages.last().map(String::as_str), Some("DeepSeek login captured."));
    println!("✅ Captured DeepSeek bundle in {:?}", started.elapsed());
}

#[tokio::test]
async fn test_deepseek_cookies_alone_never_resolve() {
    let session = Arc::new(FakeSession::new("about:blank"));
    session.set_cookies_now(deepseek_cookies());
    let policy = CapturePolicy::deepseek();
    let timings = Timings {
        capture_deadline: Duration::from_millis(400),
        ..fast_timings()
    };

    let progress = |_: &str| {};
    let started = Instant::now();
    let err = capture(session.as_ref(), &policy, &timings, &progress)
        .await
        .expect_err("Token is mandatory for DeepSeek");

    assert!(matches!(err, BridgeError::CaptureTimeout(_)), "got {:?}", err);
    let elapsed = started.elapsed();
    assert!(elapsed >= timings.capture_deadline);
    let allowed = timings.capture_deadline + timings.cookie_poll_interval;
    assert!(
        elapsed < allowed + Duration::from_millis(300),
        "Deadline overshot: {:?}",
        elapsed
    );
    println!("✅ Capture error: {}", err);
}

#[tokio::test]
async fn test_header_token_latched_first_writer_wins() {
    let session = Arc::new(FakeSession::new("about:blank"));
    let policy = CapturePolicy::deepseek();
    let timings = fast_timings();

    let script = session.clone();
    tokio::spawn(async move {
        script.wait_subscribed().await;
        for token in ["first", "second"] {
            let mut headers = HashMap::new();
            headers.insert("authorization".to_string(), format!("Bearer {}", token));
            script
                .emit(SessionEvent::Request {
                    url: "https://chat.deepseek.com/api/v0/chat/completion".to_string(),
                    headers,
                })
                .await;
        }
        // A late body token must not replace the latched header token
        script
            .emit(SessionEvent::Response {
                url: "https://chat.deepseek.com/api/v0/users/current".to_string(),
                status: 200,
                body: Some(r#"{"data":{"biz_data":{"token":"late"}}}"#.to_string()),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        script.set_cookies_now(deepseek_cookies());
    });

    let progress = |_: &str| {};
    let bundle = capture(session.as_ref(), &policy, &timings, &progress)
        .await
        .expect("Capture should succeed");

    match bundle {
        CredentialBundle::Bearer { bearer, .. } => assert_eq!(bearer, "first"),
        other => panic!("expected bearer bundle, got {:?}", other),
    }
}

#[tokio::test]
async fn test_page_closed_aborts_capture() {
    let session = Arc::new(FakeSession::new("about:blank"));
    let policy = CapturePolicy::doubao();
    let timings = fast_timings();

    let script = session.clone();
    tokio::spawn(async move {
        script.wait_subscribed().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        script.emit(SessionEvent::Closed).await;
    });

    let progress = |_: &str| {};
    let started = Instant::now();
    let err = capture(session.as_ref(), &policy, &timings, &progress)
        .await
        .expect_err("Closed page should abort");

    assert!(matches!(err, BridgeError::CaptureAborted), "got {:?}", err);
    assert!(started.elapsed() < timings.capture_deadline, "Abort must not wait for the deadline");
    assert_eq!(err.to_string(), "Browser window closed before login was captured.");
}

#[tokio::test]
async fn test_lost_connection_aborts_capture() {
    let session = Arc::new(FakeSession::new("about:blank"));
    let policy = CapturePolicy::grok();
    let timings = fast_timings();

    let script = session.clone();
    tokio::spawn(async move {
        script.wait_subscribed().await;
        script.disconnect();
    });

    let progress = |_: &str| {};
    let err = capture(session.as_ref(), &policy, &timings, &progress)
        .await
        .expect_err("Closed event channel should abort");

    assert!(matches!(err, BridgeError::CaptureAborted), "got {:?}", err);
}

#[tokio::test]
async fn test_doubao_cookie_poll_captures_session() {
    let session = Arc::new(FakeSession::new("about:blank"));
    let policy = CapturePolicy::doubao();
    let timings = fast_timings();

    let script = session.clone();
    tokio::spawn(async move {
        script.wait_subscribed().await;
        script.set_cookies_now(vec![Cookie::new("ttwid", "tw1", ".doubao.com")]);
        tokio::time::sleep(Duration::from_millis(200)).await;
        script.set_cookies_now(vec![
            Cookie::new("ttwid", "tw1", ".doubao.com"),
            Cookie::new("sessionid", "sid-9", ".doubao.com"),
        ]);
    });

    let progress = |_: &str| {};
    let bundle = capture(session.as_ref(), &policy, &timings, &progress)
        .await
        .expect("Capture should succeed");

    match bundle {
        CredentialBundle::Session {
            session_id,
            secondary_token,
            cookie,
            ..
        } => {
            assert_eq!(session_id, "sid-9");
            assert_eq!(secondary_token.as_deref(), Some("tw1"));
            assert_eq!(cookie.as_deref(), Some("ttwid=tw1; sessionid=sid-9"));
        }
        other => panic!("expected session bundle, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_response_is_ignored() {
    let session = Arc::new(FakeSession::new("about:blank"));
    let policy = CapturePolicy::deepseek();
    let timings = Timings {
        capture_deadline: Duration::from_millis(400),
        ..fast_timings()
    };
    session.set_cookies_now(deepseek_cookies());

    let script = session.clone();
    tokio::spawn(async move {
        script.wait_subscribed().await;
        script
            .emit(SessionEvent::Response {
                url: "https://chat.deepseek.com/api/v0/users/current".to_string(),
                status: 401,
                body: Some(r#"{"data":{"biz_data":{"token":"T1"}}}"#.to_string()),
            })
            .await;
    });

    let progress = |_: &str| {};
    let err = capture(session.as_ref(), &policy, &timings, &progress)
        .await
        .expect_err("Non-2xx bodies carry no token");

    assert!(matches!(err, BridgeError::CaptureTimeout(_)));
}
