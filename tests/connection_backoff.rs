//! Connect retry policy
//!
//! Only "server unavailable" is retried, with exponential backoff inside a
//! total budget. Time is paused so the waits can be measured exactly.


use iotcore_north::error::{ConnectError, RefusalCode};
use iotcore_north::testing::{MockTransport, StaticSigner};
use iotcore_north::{ConnectionState, NorthClient};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{cert_dir, mock_client, test_config};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_server_unavailable_twice_then_connected() {
    // Arrange: refusal code 3 twice, then accept
    let dir = cert_dir();
    let transport = MockTransport::new().with_connect_results(vec![
        Err(RefusalCode::ServerUnavailable),
        Err(RefusalCode::ServerUnavailable),
    ]);
    let client = mock_client(&test_config(dir.path()), transport.clone());

    // Act
    let started = Instant::now();
    let connected = client.connect().await;
    let waited = started.elapsed();

    // Assert: 500 + 750 ms of backoff, three attempts, connected
    assert!(connected);
    assert_eq!(transport.connect_attempts(), 3);
    assert!(waited >= Duration::from_millis(1250), "waited {waited:?}");
    assert!(waited < Duration::from_millis(1300), "waited {waited:?}");
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_refusals_are_not_retried() {
    for code in [
        RefusalCode::UnacceptableProtocolVersion,
        RefusalCode::IdentifierRejected,
        RefusalCode::BadUserNameOrPassword,
        RefusalCode::NotAuthorized,
        RefusalCode::Other(-1),
    ] {
        let dir = cert_dir();
        let transport = MockTransport::new().with_connect_results(vec![Err(code)]);
        let client = mock_client(&test_config(dir.path()), transport.clone());

        let started = Instant::now();
        let err = client.try_connect().await.unwrap_err();

        assert_eq!(err.refusal_code(), Some(code));
        assert_eq!(transport.connect_attempts(), 1, "{code} must not be retried");
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_is_never_exceeded() {
    let dir = cert_dir();
    let transport =
        MockTransport::new().with_connect_results(vec![Err(RefusalCode::ServerUnavailable); 400]);
    let client = mock_client(&test_config(dir.path()), transport.clone());

    let started = Instant::now();
    let err = client.try_connect().await.unwrap_err();
    let waited = started.elapsed();

    match err {
        ConnectError::RetryBudgetExhausted {
            attempts,
            max_elapsed,
        } => {
            assert_eq!(attempts, 155);
            assert_eq!(max_elapsed, Duration::from_millis(900_000));
        }
        other => panic!("expected budget exhaustion, got {other}"),
    }
    assert_eq!(transport.connect_attempts(), 155);
    assert!(waited <= Duration::from_millis(900_000), "waited {waited:?}");
    assert!(waited >= Duration::from_millis(898_079), "waited {waited:?}");
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_custom_retry_settings_apply() {
    let dir = cert_dir();
    let mut config = test_config(dir.path());
    config.retry.initial_interval_ms = 100;
    config.retry.multiplier = 2.0;
    config.retry.max_interval_ms = 300;
    config.retry.max_elapsed_ms = 1_000;

    let transport =
        MockTransport::new().with_connect_results(vec![Err(RefusalCode::ServerUnavailable); 20]);
    let client = mock_client(&config, transport.clone());

    let err = client.try_connect().await.unwrap_err();

    // 100 + 200 + 300 + 300 = 900; a further 300 would overrun the budget
    assert!(matches!(
        err,
        ConnectError::RetryBudgetExhausted { attempts: 5, .. }
    ));
    assert_eq!(transport.connect_attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_zero_interval_config_still_gives_up_within_budget() {
    let dir = cert_dir();
    let mut config = test_config(dir.path());
    config.retry.initial_interval_ms = 0;
    config.retry.multiplier = 0.0;
    config.retry.max_elapsed_ms = 50;

    let transport =
        MockTransport::new().with_connect_results(vec![Err(RefusalCode::ServerUnavailable); 100]);
    let (client, problems) = NorthClient::with_signer(
        &config,
        transport.clone(),
        Arc::new(StaticSigner::default()),
    );
    assert_eq!(problems.len(), 2);

    let started = Instant::now();
    let err = client.try_connect().await.unwrap_err();

    // Clamped to 1 ms waits: 50 of them, then give up
    assert!(matches!(
        err,
        ConnectError::RetryBudgetExhausted { attempts: 51, .. }
    ));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(50), "waited {waited:?}");
    assert!(waited < Duration::from_millis(200), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn test_background_connect_completes() {
    let dir = cert_dir();
    let transport =
        MockTransport::new().with_connect_results(vec![Err(RefusalCode::ServerUnavailable)]);
    let client = mock_client(&test_config(dir.path()), transport.clone());

    let handle = client.spawn_connect();
    assert!(handle.await.unwrap());
    assert!(client.is_connected());
    assert_eq!(transport.connect_attempts(), 2);
}

#[tokio::test]
async fn test_token_is_session_password_and_reused_across_reconnects() {
    let dir = cert_dir();
    let transport = MockTransport::new();
    let client = mock_client(&test_config(dir.path()), transport.clone());

    assert!(client.connect().await);
    transport.drop_connection("network unreachable");
    assert!(!client.is_connected());
    assert!(client.connect().await);

    let sessions = transport.sessions();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].username, "unused");
    assert!(sessions[0].password.starts_with("signed-1-ES256-"));
    assert_eq!(sessions[0].password, sessions[1].password);
    assert_eq!(
        transport.subscriptions(),
        vec!["/devices/gateway-1/errors", "/devices/gateway-1/errors"]
    );
}
