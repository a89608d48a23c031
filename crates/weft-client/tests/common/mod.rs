//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::time::Duration;

use weft_client::{ClientConfig, LoopbackFactory, LoopbackHandle, WeftClient};
use weft_protocol::{WireMessage, msg};

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

/// A client wired to loopback transports.
pub fn loopback_client() -> (WeftClient, LoopbackFactory) {
    init_tracing();
    let factory = LoopbackFactory::new();
    let client =
        WeftClient::with_transport_factory(ClientConfig::default(), Box::new(factory.clone()));
    (client, factory)
}

/// Poll `cond` until it holds, for up to two seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn server_setup(keepalive_timeout: u64) -> WireMessage {
    WireMessage::with_body(
        msg::SETUP,
        0,
        serde_json::json!({ "version": "1.0", "keepaliveTimeout": keepalive_timeout }),
    )
}

pub fn auth_state(state: &str) -> WireMessage {
    WireMessage::with_body(msg::AUTH_STATE, 0, serde_json::json!({ "state": state }))
}

pub fn channel_opened(channel: u64, service: &str) -> WireMessage {
    WireMessage::with_body(
        msg::CHANNEL_OPENED,
        channel,
        serde_json::json!({ "service": service }),
    )
}

pub fn channel_closed(channel: u64) -> WireMessage {
    WireMessage::new(msg::CHANNEL_CLOSED, channel)
}

pub fn kinds(messages: &[WireMessage]) -> Vec<String> {
    messages.iter().map(|m| m.kind.clone()).collect()
}

/// Drive a fresh client through the authorized handshake.
pub async fn connected_client_with_auth() -> (WeftClient, LoopbackFactory, LoopbackHandle) {
    let (client, factory) = loopback_client();
    client.set_auth_token("secret");
    let pending = client.connect("wss://hub.test/messaging");
    let handle = factory.last().expect("transport created eagerly");

    handle.open();
    handle.deliver(server_setup(60));
    handle.deliver(auth_state("UNAUTHORIZED"));
    handle.deliver(auth_state("AUTHORIZED"));

    tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("connect timed out")
        .expect("connect failed");
    (client, factory, handle)
}
