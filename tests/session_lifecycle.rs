mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeConnector, Outcome, Reply, context, context_with_pools, credentials, echo};
use futures::future::join_all;
use netfleet::config::{PoolLimits, SessionOptions};
use netfleet::error::SessionError;
use netfleet::session::{ConnectOptions, Session, SessionContext, SessionState, Target, Transport};

fn session(ctx: &SessionContext, host: &str) -> Session {
    Session::new("r1", Target::new(host, 22), credentials(), ctx.clone())
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_handshake() {
    let connector = FakeConnector::new(echo());
    connector.delay_handshakes(Duration::from_millis(200));
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");

    let attempts = (0..5).map(|_| {
        let session = session.clone();
        async move { session.connect().await }
    });
    let results = join_all(attempts).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(connector.connects(), 1);
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(ctx.pools.connections.in_use(), 1);
}

#[tokio::test(start_paused = true)]
async fn connections_pool_bounds_connected_sessions() {
    let connector = FakeConnector::new(echo());
    let limits = PoolLimits {
        connections: 2,
        ..Default::default()
    };
    let ctx = context_with_pools(connector.clone(), limits);
    let first = session(&ctx, "10.0.0.1");
    let second = session(&ctx, "10.0.0.2");
    let third = session(&ctx, "10.0.0.3");

    first.connect().await.expect("first connects");
    second.connect().await.expect("second connects");

    let waiting = tokio::spawn({
        let third = third.clone();
        async move { third.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(third.state(), SessionState::WaitingConnect);
    assert_eq!(connector.connects(), 2);

    first.disconnect().await;
    waiting
        .await
        .expect("connect task")
        .expect("third connects once a slot is free");
    assert_eq!(third.state(), SessionState::Connected);
    assert_eq!(ctx.pools.connections.in_use(), 2);
}

#[tokio::test]
async fn disconnect_is_idempotent_and_releases_the_slot() {
    let connector = FakeConnector::new(echo());
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    session.connect().await.expect("connect");
    let transport = connector.last_transport();
    session.disconnect().await;
    session.disconnect().await;

    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(transport.is_closed());
    assert_eq!(ctx.pools.connections.in_use(), 0);
}

#[tokio::test]
async fn connect_on_connected_session_is_a_no_op() {
    let connector = FakeConnector::new(echo());
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");

    session.connect().await.expect("connect");
    session.connect().await.expect("connect again");
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn rejected_credentials_are_reported_as_authentication_errors() {
    let connector = FakeConnector::new(echo());
    connector.fail_next([Outcome::Denied]);
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");

    let err = session.connect().await.expect_err("login rejected");
    assert!(matches!(err, SessionError::Authentication(_)));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(session.last_error(), Some(err));
    assert_eq!(ctx.pools.connections.in_use(), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_retries_until_an_attempt_succeeds() {
    let connector = FakeConnector::new(echo());
    connector.fail_next([Outcome::Refused, Outcome::Refused]);
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");
    let mut states = session.subscribe();

    let options = ConnectOptions {
        attempts: 3,
        connect_timeout: Duration::from_secs(5),
        reconnect_timeout: Duration::from_secs(15),
    };
    let connecting = tokio::spawn({
        let session = session.clone();
        async move { session.connect_with(options).await }
    });

    states
        .wait_for(|state| *state == SessionState::WaitingReconnect)
        .await
        .expect("session alive");
    connecting.await.expect("connect task").expect("third attempt succeeds");

    assert_eq!(connector.connects(), 3);
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.last_error(), None);
}

#[tokio::test(start_paused = true)]
async fn connect_gives_up_after_the_last_attempt() {
    let connector = FakeConnector::new(echo());
    connector.fail_next([Outcome::Refused, Outcome::Refused]);
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");

    let options = ConnectOptions {
        attempts: 2,
        ..Default::default()
    };
    let err = session.connect_with(options).await.expect_err("both refused");

    assert!(matches!(err, SessionError::Connect(ref message) if message.contains("refused")));
    assert_eq!(connector.connects(), 2);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn stalled_handshake_times_out() {
    let connector = FakeConnector::new(echo());
    connector.fail_next([Outcome::Stall]);
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");

    let err = session.connect().await.expect_err("stalled");
    assert_eq!(err, SessionError::Connect("10.0.0.1:22: timeout".to_string()));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn proxied_session_needs_a_connected_proxy() {
    let connector = FakeConnector::new(echo());
    let ctx = context(connector.clone());
    let jump = Session::new("jump", Target::new("192.0.2.1", 22), credentials(), ctx.clone());
    let device = Session::proxied(
        "r1",
        Target::new("10.0.0.1", 22),
        credentials(),
        &jump,
        ctx.clone(),
    );

    let err = device.connect().await.expect_err("proxy is down");
    assert!(matches!(err, SessionError::Proxy(_)));
    assert_eq!(connector.connects(), 0);

    jump.connect().await.expect("jump connects");
    let jump_transport = connector.last_transport();
    device.connect().await.expect("device connects through jump");

    assert_eq!(
        jump_transport.tunnels.lock().unwrap().as_slice(),
        [Target::new("10.0.0.1", 22)]
    );
    assert_eq!(device.proxy().map(|proxy| proxy.device_id().to_string()).as_deref(), Some("jump"));
}

#[tokio::test]
async fn refused_tunnel_is_a_proxy_error() {
    let connector = FakeConnector::new(echo());
    let ctx = context(connector.clone());
    let jump = Session::new("jump", Target::new("192.0.2.1", 22), credentials(), ctx.clone());
    let device = Session::proxied(
        "r1",
        Target::new("10.0.0.1", 22),
        credentials(),
        &jump,
        ctx.clone(),
    );
    jump.connect().await.expect("jump connects");

    connector.fail_next([Outcome::Refused]);
    let err = device.connect().await.expect_err("tunnel refused");
    assert!(matches!(err, SessionError::Proxy(ref message) if message.starts_with("10.0.0.1:22")));
    assert!(jump.is_connected());
}

#[tokio::test]
async fn execute_returns_output_of_the_command() {
    let connector = FakeConnector::new(echo());
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");
    session.connect().await.expect("connect");

    let output = session.execute_default("show version").await.expect("execute");
    assert_eq!(output.stdout, "show version\n");
    assert_eq!(output.stderr, "");
    assert_eq!(output.exit_status, Some(0));
    assert!(session.requests().is_empty());
}

#[tokio::test]
async fn execute_writes_password_to_stdin() {
    let connector = FakeConnector::new(echo());
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");
    session.connect().await.expect("connect");

    session
        .execute("su -", Duration::from_secs(5), Some("rootpw"))
        .await
        .expect("execute");
    let transport = connector.last_transport();
    assert_eq!(transport.stdin.lock().unwrap().as_slice(), ["rootpw\n"]);
}

#[tokio::test]
async fn execute_without_connection_fails_immediately() {
    let connector = FakeConnector::new(echo());
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");

    let err = session.execute_default("show version").await.expect_err("not connected");
    assert_eq!(err, SessionError::Execution("not connected".to_string()));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn execute_timeout_releases_the_execution_slot() {
    let connector = FakeConnector::new(Arc::new(|command: &str| match command {
        "monitor traffic" => Reply::hang(),
        other => Reply::stdout(other),
    }));
    let limits = PoolLimits {
        executions: 1,
        ..Default::default()
    };
    let ctx = context_with_pools(connector.clone(), limits);
    let session = session(&ctx, "10.0.0.1");
    session.connect().await.expect("connect");

    let err = session
        .execute("monitor traffic", Duration::from_secs(2), None)
        .await
        .expect_err("never answers");
    assert!(matches!(err, SessionError::Execution(ref message) if message.contains("timed out")));
    assert_eq!(ctx.pools.executions.available(), 1);
    assert!(session.requests().is_empty());

    assert!(session.is_connected());
    let output = session.execute_default("show version").await.expect("next command runs");
    assert_eq!(output.stdout, "show version");
}

#[tokio::test]
async fn execute_on_a_dropped_connection_disconnects_the_session() {
    let connector = FakeConnector::new(echo());
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");
    session.connect().await.expect("connect");

    connector.last_transport().drop_connection();
    let err = session.execute_default("show version").await.expect_err("dropped");
    assert!(matches!(err, SessionError::Execution(_)));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(ctx.pools.connections.in_use(), 0);

    session.connect().await.expect("reconnect");
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn connection_lost_mid_command_is_an_execution_error() {
    let connector = FakeConnector::new(Arc::new(|command: &str| match command {
        "show log messages" => Reply::broken("Oct 16 10:00:01 r1 kernel: "),
        other => Reply::stdout(other),
    }));
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");
    session.connect().await.expect("connect");

    let err = session
        .execute_default("show log messages")
        .await
        .expect_err("truncated output");
    assert!(
        matches!(err, SessionError::Execution(ref message) if message.contains("transport closed"))
    );
    assert_eq!(session.last_error(), Some(err));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(ctx.pools.connections.in_use(), 0);
    assert!(session.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn keepalive_notices_a_closed_transport() {
    let connector = FakeConnector::new(echo());
    let options = SessionOptions {
        keepalive_secs: 5,
        ..common::quiet_options()
    };
    let ctx = context(connector.clone()).with_options(options);
    let session = session(&ctx, "10.0.0.1");
    let mut states = session.subscribe();
    session.connect().await.expect("connect");

    connector.last_transport().drop_connection();
    states
        .wait_for(|state| *state == SessionState::Disconnected)
        .await
        .expect("session alive");

    assert!(matches!(
        session.last_error(),
        Some(SessionError::Connect(ref message)) if message.contains("keepalive")
    ));
    assert_eq!(ctx.pools.connections.in_use(), 0);
}

#[tokio::test]
async fn scoped_disconnects_after_the_routine_fails() {
    let connector = FakeConnector::new(echo());
    let ctx = context(connector.clone());
    let session = session(&ctx, "10.0.0.1");

    let result: anyhow::Result<()> = session
        .scoped(|session| async move {
            session.execute_default("show version").await?;
            anyhow::bail!("routine failed")
        })
        .await;

    assert_eq!(result.expect_err("routine error").to_string(), "routine failed");
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(connector.connects(), 1);
}
