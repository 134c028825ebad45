//! Local context registry, interfaces and twins.
//!
//! Everything here runs inside one runtime; no connection is made.

mod common;

use async_trait::async_trait;
use common::{config, eventually_async, Anonymous, Opaque, Sample};
use netron_kernel::{twin_factory, Netron, StockInterface, Twin};
use netron_types::error::{NetronError, NetronResult};
use netron_types::event::NetronEvent;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_attach_detach_attach_same_name() {
    let netron = Netron::new(config("local"));
    let first = netron
        .attach_context(Sample::arc(), Some("a"))
        .await
        .unwrap();
    netron.detach_context("a").await.unwrap();
    let second = netron
        .attach_context(Sample::arc(), Some("a"))
        .await
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(netron.context_names(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_attach_twice_is_exists() {
    let netron = Netron::new(config("local"));
    let context = Sample::arc();
    netron
        .attach_context(Arc::clone(&context), Some("a"))
        .await
        .unwrap();
    let err = netron
        .attach_context(context, Some("a"))
        .await
        .unwrap_err();
    assert!(matches!(err, NetronError::Exists(_)));
    assert_eq!(netron.context_names(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_attach_uses_class_name_by_default() {
    let netron = Netron::new(config("local"));
    let id = netron.attach_context(Sample::arc(), None).await.unwrap();
    assert!(netron.has_context("Sample"));
    let definition = netron.get_definition_by_id(id, None).unwrap();
    assert_eq!(definition.name, "Sample");
    assert!(definition.property("version").unwrap().readonly);
}

#[tokio::test]
async fn test_attach_validation() {
    let netron = Netron::new(config("local"));

    let err = netron
        .attach_context(Arc::new(Opaque), None)
        .await
        .unwrap_err();
    assert!(matches!(err, NetronError::NotValid(_)));

    let err = netron
        .attach_context(Arc::new(Anonymous { private: true }), Some("anon"))
        .await
        .unwrap_err();
    assert!(matches!(err, NetronError::NotAllowed(_)));

    let err = netron
        .attach_context(Arc::new(Anonymous { private: false }), None)
        .await
        .unwrap_err();
    assert!(matches!(err, NetronError::NotValid(_)));

    netron
        .attach_context(Arc::new(Anonymous { private: false }), Some("anon"))
        .await
        .unwrap();
    assert_eq!(netron.context_names(), vec!["anon".to_string()]);
}

#[tokio::test]
async fn test_detach_unknown_context() {
    let netron = Netron::new(config("local"));
    let err = netron.detach_context("missing").await.unwrap_err();
    match err {
        NetronError::Unknown(msg) => assert!(msg.contains("missing")),
        other => panic!("Expected Unknown, got {other:?}"),
    }
}

#[tokio::test]
async fn test_attach_and_detach_publish_events() {
    let netron = Netron::new(config("local"));
    let mut events = netron.subscribe();
    let id = netron
        .attach_context(Sample::arc(), Some("a"))
        .await
        .unwrap();
    netron.detach_context("a").await.unwrap();

    match events.recv().await.unwrap() {
        NetronEvent::ContextAttach { definition, origin } => {
            assert_eq!(definition.id, id);
            assert!(origin.is_none());
        }
        other => panic!("Expected ContextAttach, got {other:?}"),
    }
    match events.recv().await.unwrap() {
        NetronEvent::ContextDetach { name, def_id, .. } => {
            assert_eq!(name, "a");
            assert_eq!(def_id, id);
        }
        other => panic!("Expected ContextDetach, got {other:?}"),
    }
}

#[tokio::test]
async fn test_local_get_with_default() {
    let netron = Netron::new(config("local"));
    let id = netron
        .attach_context(Sample::arc(), Some("a"))
        .await
        .unwrap();

    let value = netron
        .get(None, id, "undefined_prop", Some(json!("fallback")))
        .await
        .unwrap();
    assert_eq!(value, Some(json!("fallback")));

    netron
        .set(None, id, "undefined_prop", Some(json!(7)))
        .await
        .unwrap();
    let value = netron
        .get(None, id, "undefined_prop", Some(json!("fallback")))
        .await
        .unwrap();
    assert_eq!(value, Some(json!(7)));
}

#[tokio::test]
async fn test_local_set_get_round_trip() {
    let netron = Netron::new(config("local"));
    netron
        .attach_context(Sample::arc(), Some("a"))
        .await
        .unwrap();
    let iface = netron.get_interface_by_name("a", None).unwrap();
    let store = iface.property("store");

    let values = [
        Some(Value::Null),
        None,
        Some(json!(0)),
        Some(json!(false)),
        Some(json!("")),
        Some(json!([1, 2, 3])),
        Some(json!({"a": 1})),
    ];
    for value in values {
        store.set(value.clone()).await.unwrap();
        assert_eq!(store.get(None).await.unwrap(), value);
    }
}

#[tokio::test]
async fn test_local_call_error_message() {
    let netron = Netron::new(config("local"));
    netron
        .attach_context(Sample::arc(), Some("a"))
        .await
        .unwrap();
    let iface = netron.get_interface_by_name("a", None).unwrap();
    let err = iface.call("error", vec![]).await.unwrap_err();
    assert_eq!(err.to_string(), "I'm an error!");
    assert!(matches!(err, NetronError::Remote(_)));
}

#[tokio::test]
async fn test_local_member_checks() {
    let netron = Netron::new(config("local"));
    let id = netron
        .attach_context(Sample::arc(), Some("a"))
        .await
        .unwrap();

    let err = netron
        .set(None, id, "version", Some(json!("2.0")))
        .await
        .unwrap_err();
    assert!(matches!(err, NetronError::NotAllowed(_)));

    let err = netron.call(None, id, "counter", vec![]).await.unwrap_err();
    assert!(matches!(err, NetronError::InvalidArgument(_)));

    let err = netron.call(None, id, "missing", vec![]).await.unwrap_err();
    assert!(matches!(err, NetronError::Unknown(_)));

    let err = netron.call(None, 999, "increment", vec![]).await.unwrap_err();
    assert!(matches!(err, NetronError::Unknown(_)));

    let err = netron.get_interface_by_name("nope", None).unwrap_err();
    assert!(matches!(err, NetronError::Unknown(_)));
}

#[tokio::test]
async fn test_local_call_void_ignores_failure() {
    let netron = Netron::new(config("local"));
    let id = netron
        .attach_context(Sample::arc(), Some("a"))
        .await
        .unwrap();
    netron.call_void(None, id, "error", vec![]).await.unwrap();
    netron
        .call_void(None, id, "increment", vec![json!(3)])
        .await
        .unwrap();
    assert!(
        eventually_async(|| async {
            netron.get(None, id, "counter", None).await.unwrap() == Some(json!(3))
        })
        .await
    );

    let err = netron
        .call_void(None, id, "store", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, NetronError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_local_call_void_does_not_wait_for_method() {
    let netron = Netron::new(config("local"));
    assert!(netron.config().response_timeout().is_none());
    let id = netron
        .attach_context(Sample::arc(), Some("a"))
        .await
        .unwrap();
    let iface = netron.get_interface_by_name("a", None).unwrap();

    let settled = tokio::time::timeout(Duration::from_secs(2), async {
        netron.call_void(None, id, "slow", vec![]).await.unwrap();
        iface.call_void("slow", vec![]).await.unwrap();
    })
    .await;
    assert!(settled.is_ok(), "call_void waited for a method that never returns");
}

#[tokio::test]
async fn test_local_timeout() {
    let mut cfg = config("local");
    cfg.response_timeout_ms = Some(100);
    let netron = Netron::new(cfg);
    let id = netron
        .attach_context(Sample::arc(), Some("a"))
        .await
        .unwrap();
    let err = netron.call(None, id, "slow", vec![]).await.unwrap_err();
    assert!(matches!(err, NetronError::Timeout(100)));
    netron.call_void(None, id, "slow", vec![]).await.unwrap();
    netron
        .set(None, id, "blackhole", Some(json!(1)))
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Twins
// ---------------------------------------------------------------------------

/// Doubles every increment and answers `echo` itself.
struct Doubler {
    stock: StockInterface,
}

#[async_trait]
impl Twin for Doubler {
    fn stock(&self) -> &StockInterface {
        &self.stock
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Option<Value>> {
        match method {
            "increment" => {
                let step = args.first().and_then(Value::as_i64).unwrap_or(1);
                self.stock.call("increment", vec![json!(step * 2)]).await
            }
            "echo" => Ok(Some(json!("twin"))),
            _ => self.stock.call(method, args).await,
        }
    }
}

#[tokio::test]
async fn test_twin_overrides_and_delegates() {
    let netron = Netron::new(config("local"));
    netron
        .attach_context(Sample::arc(), Some("a"))
        .await
        .unwrap();
    netron
        .set_interface_twin("a", twin_factory(|stock| Doubler { stock }))
        .unwrap();

    let iface = netron.get_interface_by_name("a", None).unwrap();
    assert!(iface.is_twin());
    assert_eq!(
        iface.call("increment", vec![json!(2)]).await.unwrap(),
        Some(json!(4))
    );
    assert_eq!(
        iface.call("echo", vec![json!("x")]).await.unwrap(),
        Some(json!("twin"))
    );
    // Not overridden: falls through to the stock interface.
    assert_eq!(
        iface.property("counter").get(None).await.unwrap(),
        Some(json!(4))
    );
    // The stock interface stays reachable.
    assert_eq!(
        iface.stock().call("echo", vec![json!("x")]).await.unwrap(),
        Some(json!("x"))
    );
}

#[tokio::test]
async fn test_twin_registration_rules() {
    let netron = Netron::new(config("local"));
    netron
        .set_interface_twin("a", twin_factory(|stock| Doubler { stock }))
        .unwrap();
    let err = netron
        .set_interface_twin("a", twin_factory(|stock| Doubler { stock }))
        .unwrap_err();
    assert!(matches!(err, NetronError::Exists(_)));

    let err = netron
        .set_interface_twin("", twin_factory(|stock| Doubler { stock }))
        .unwrap_err();
    assert!(matches!(err, NetronError::InvalidArgument(_)));

    netron
        .attach_context(Sample::arc(), Some("b"))
        .await
        .unwrap();
    assert!(!netron.get_interface_by_name("b", None).unwrap().is_twin());
}

#[tokio::test]
async fn test_peer_lookup_errors() {
    let netron = Netron::new(config("local"));
    assert!(matches!(
        netron.get_peer(""),
        Err(NetronError::InvalidArgument(_))
    ));
    assert!(matches!(
        netron.get_peer("ghost"),
        Err(NetronError::Unknown(_))
    ));
    netron.ping(None).await.unwrap();
    assert!(matches!(
        netron.ping(Some("ghost")).await,
        Err(NetronError::Unknown(_))
    ));
    assert!(netron.peer_uids().is_empty());
}
