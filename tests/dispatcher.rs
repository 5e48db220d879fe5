mod common;

use common::{
    http_get, noop_hook, resolver, unreachable_hook, upstream, Aborts, StaticLookup, BODY,
};
use relay_tunnel::{
    config::{RelayConfig, Ssl},
    outbound::{ConnectionContext, Dispatcher, Route},
    resolver::Blocklist,
    ErrorCode,
};
use tokio::sync::oneshot;

fn relay(protocol: &str) -> RelayConfig {
    RelayConfig {
        protocol: protocol.to_string(),
        host: "127.0.0.1".to_string(),
        port: 1,
        username: None,
        password: Some("secret".to_string()),
        cipher: None,
        ssl: Ssl::default(),
    }
}

#[tokio::test]
async fn unknown_protocol_fails_before_any_network_work() {
    let lookup = StaticLookup::new("127.0.0.1");
    let dispatcher = Dispatcher::new(resolver(lookup.clone(), Blocklist::default()));
    let aborts = Aborts::default();

    let ctx = ConnectionContext::new(
        "upstream.test",
        80,
        unreachable_hook,
        aborts.signal(),
    );
    let err = dispatcher
        .connect(ctx, &Route::Relay(relay("vmess")))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::UnsupportedProtocol);
    assert!(err.to_string().contains("vmess"));
    assert_eq!(aborts.count(), 1);
    assert_eq!(lookup.calls(), 0);
}

#[tokio::test]
async fn blocked_address_aborts_once() {
    let lookup = StaticLookup::new("10.1.2.3");
    let dispatcher = Dispatcher::new(resolver(lookup.clone(), Blocklist::new(true)));
    let aborts = Aborts::default();

    let ctx = ConnectionContext::new(
        "intranet.test",
        80,
        unreachable_hook,
        aborts.signal(),
    );
    let err = dispatcher.connect(ctx, &Route::Origin).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::BlockedHost);
    assert_eq!(err.code().as_str(), "BLOCKED_HOST");
    assert_eq!(aborts.count(), 1);
    assert_eq!(lookup.calls(), 1);
}

#[tokio::test]
async fn blocked_literal_skips_resolution() {
    let lookup = StaticLookup::new("203.0.113.1");
    let dispatcher = Dispatcher::new(resolver(lookup.clone(), Blocklist::new(true)));
    let aborts = Aborts::default();

    let ctx = ConnectionContext::new("127.0.0.1", 80, noop_hook, aborts.signal());
    let err = dispatcher.connect(ctx, &Route::Origin).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::BlockedHost);
    assert_eq!(lookup.calls(), 0);
    assert_eq!(aborts.count(), 1);
}

#[tokio::test]
async fn origin_round_trip() {
    let upstream = upstream().await;
    let lookup = StaticLookup::new("127.0.0.1");
    let dispatcher = Dispatcher::new(resolver(lookup.clone(), Blocklist::default()));
    let aborts = Aborts::default();
    let (tx, rx) = oneshot::channel();

    let ctx = ConnectionContext::new(
        "upstream.test",
        upstream.port(),
        move |stream| async move {
            let body = http_get(stream, "upstream.test").await?;
            let _ = tx.send(body);
            Ok::<_, anyhow::Error>(())
        },
        aborts.signal(),
    );
    dispatcher.connect(ctx, &Route::Origin).await.unwrap();

    assert_eq!(rx.await.unwrap(), BODY);
    assert_eq!(aborts.count(), 0);
    assert_eq!(lookup.calls(), 1);
    assert_eq!(dispatcher.resolver().cache().get("upstream.test").as_deref(), Some("127.0.0.1"));
}

#[tokio::test]
async fn hook_failure_aborts() {
    let upstream = upstream().await;
    let dispatcher = Dispatcher::new(resolver(
        StaticLookup::new("127.0.0.1"),
        Blocklist::default(),
    ));
    let aborts = Aborts::default();

    let ctx = ConnectionContext::new(
        "127.0.0.1",
        upstream.port(),
        |_| async { Err::<(), _>(anyhow::anyhow!("client went away")) },
        aborts.signal(),
    );
    let err = dispatcher.connect(ctx, &Route::Origin).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::HookFailure);
    assert!(err.to_string().contains("client went away"));
    assert_eq!(aborts.count(), 1);
}

#[tokio::test]
async fn refused_relay_is_io_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let dispatcher = Dispatcher::new(resolver(
        StaticLookup::new("127.0.0.1"),
        Blocklist::default(),
    ));
    let aborts = Aborts::default();
    let mut config = relay("socks5");
    config.password = None;
    config.port = port;

    let ctx = ConnectionContext::new("127.0.0.1", 80, noop_hook, aborts.signal());
    let err = dispatcher
        .connect(ctx, &Route::Relay(config))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::IoFailure);
    assert!(err.to_string().starts_with("socks5: "));
    assert_eq!(aborts.count(), 1);
}
