//! Registry Module Tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{json, Value};
use test_case::test_case;

use super::sample::{Counter, Emitter, COUNTER_TYPE, SAMPLE_EVENT};
use super::*;
use crate::Error;

fn name(s: &str) -> ObjectName {
    ObjectName::parse(s).unwrap()
}

fn counting_listener() -> (Arc<dyn NotificationListener>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let listener: Arc<dyn NotificationListener> =
        Arc::new(move |_n: &Notification, _h: Option<&Value>| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    (listener, count)
}

fn registry() -> (LocalRegistry, Arc<Emitter>) {
    let registry = LocalRegistry::new("mqmx");
    registry
        .register(name("mqmx:type=Counter,name=hits"), Arc::new(Counter::new("hits")))
        .unwrap();
    let emitter = Arc::new(Emitter::new(name("events:type=Emitter")));
    registry
        .register(name("events:type=Emitter"), emitter.clone())
        .unwrap();
    (registry, emitter)
}

// =============================================================================
// ObjectName
// =============================================================================

#[test]
fn test_object_name_canonical_ordering() {
    let a = name("mqmx:type=Counter,name=hits");
    let b = name("mqmx:name=hits,type=Counter");
    assert_eq!(a, b);
    assert_eq!(a.canonical_name(), "mqmx:name=hits,type=Counter");
    assert_eq!(a.to_string(), "mqmx:type=Counter,name=hits");
    assert_eq!(a.key_property("type"), Some("Counter"));
    assert!(!a.is_pattern());
}

#[test_case("mqmx:*", "mqmx:type=Counter,name=hits", true ; "any properties")]
#[test_case("mq*:type=Counter,*", "mqmx:type=Counter,name=hits", true ; "domain wildcard")]
#[test_case("mqm?:type=Counter,name=hits", "mqmx:type=Counter,name=hits", true ; "single char wildcard")]
#[test_case("mqmx:type=Counter", "mqmx:type=Counter,name=hits", false ; "exact needs all keys")]
#[test_case("mqmx:type=Gauge,*", "mqmx:type=Counter,name=hits", false ; "value mismatch")]
#[test_case("other:*", "mqmx:type=Counter,name=hits", false ; "domain mismatch")]
fn test_object_name_pattern_matching(pattern: &str, candidate: &str, expected: bool) {
    let pattern = name(pattern);
    assert_eq!(pattern.matches(&name(candidate)), expected);
}

#[test_case("no-colon" ; "missing domain separator")]
#[test_case("mqmx:" ; "no properties")]
#[test_case("mqmx:type" ; "missing value")]
#[test_case("mqmx:type=a,type=b" ; "duplicate key")]
#[test_case("mqmx:*,type=a" ; "wildcard not last")]
fn test_object_name_rejects(raw: &str) {
    assert!(matches!(
        ObjectName::parse(raw),
        Err(ManagementError::MalformedObjectName(_))
    ));
}

#[test]
fn test_object_name_serializes_as_string() {
    let n = name("mqmx:type=Counter");
    assert_eq!(serde_json::to_value(&n).unwrap(), json!("mqmx:type=Counter"));
    let back: ObjectName = serde_json::from_value(json!("mqmx:type=Counter")).unwrap();
    assert_eq!(back, n);
    assert!(serde_json::from_value::<ObjectName>(json!("broken")).is_err());
}

proptest! {
    #[test]
    fn prop_object_name_matches_itself(
        domain in "[a-z]{1,6}",
        keys in proptest::collection::btree_map("[a-z]{1,4}", "[a-z0-9]{1,4}", 1..4),
    ) {
        let list: Vec<String> = keys.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let n = name(&format!("{}:{}", domain, list.join(",")));
        prop_assert!(n.matches(&n));
        let domain_pattern = name(&format!("{}:*", domain));
        prop_assert!(domain_pattern.matches(&n));
        prop_assert_eq!(name(n.canonical_name()), n.clone());
    }
}

// =============================================================================
// Notifications
// =============================================================================

#[test]
fn test_opaque_source_is_not_serializable() {
    let ok = Notification::new(SAMPLE_EVENT, NotificationSource::Connector("c".into()), 1, "m");
    assert!(serde_json::to_string(&ok).is_ok());

    let opaque = Notification::new(
        SAMPLE_EVENT,
        NotificationSource::Opaque(OpaqueSource::new(42u32)),
        2,
        "m",
    );
    assert!(serde_json::to_string(&opaque).is_err());
    if let NotificationSource::Opaque(source) = &opaque.source {
        assert_eq!(source.downcast_ref::<u32>(), Some(&42));
    }
}

#[test]
fn test_broadcaster_filter_and_handback() {
    let broadcaster = NotificationBroadcaster::new();
    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = received.clone();
    let listener: Arc<dyn NotificationListener> =
        Arc::new(move |n: &Notification, h: Option<&Value>| {
            sink.lock().push((n.message.clone(), h.cloned()));
        });
    let only_even: NotificationFilter = Arc::new(|n: &Notification| n.sequence % 2 == 0);
    broadcaster.add_listener(listener, Some(only_even), Some(json!("hb")));

    for _ in 0..4 {
        let seq = broadcaster.next_sequence();
        broadcaster.send(&Notification::new(
            "t",
            NotificationSource::Connector("x".into()),
            seq,
            format!("n{}", seq),
        ));
    }

    assert_eq!(
        *received.lock(),
        vec![
            ("n2".to_string(), Some(json!("hb"))),
            ("n4".to_string(), Some(json!("hb")))
        ]
    );
}

#[test]
fn test_broadcaster_remove_semantics() {
    let broadcaster = NotificationBroadcaster::new();
    let (listener, _) = counting_listener();
    let (stranger, _) = counting_listener();
    let filter: NotificationFilter = Arc::new(|_n: &Notification| true);

    broadcaster.add_listener(listener.clone(), None, None);
    broadcaster.add_listener(listener.clone(), Some(filter.clone()), Some(json!(1)));
    assert_eq!(broadcaster.listener_count(), 2);

    assert!(matches!(
        broadcaster.remove_listener(&stranger),
        Err(ManagementError::ListenerNotFound(_))
    ));
    // Exact match only removes the one registration
    assert!(broadcaster
        .remove_listener_with(&listener, Some(&filter), Some(&json!(2)))
        .is_err());
    broadcaster
        .remove_listener_with(&listener, Some(&filter), Some(&json!(1)))
        .unwrap();
    assert_eq!(broadcaster.listener_count(), 1);

    broadcaster.add_listener(listener.clone(), None, None);
    broadcaster.remove_listener(&listener).unwrap();
    assert_eq!(broadcaster.listener_count(), 0);
}

// =============================================================================
// LocalRegistry
// =============================================================================

#[tokio::test]
async fn test_registry_attributes_and_operations() {
    let (registry, _) = registry();
    let counter = name("mqmx:type=Counter,name=hits");

    assert_eq!(registry.get_attribute(&counter, "Count").await.unwrap(), json!(0));
    registry
        .set_attribute(&counter, Attribute::new("Count", 5))
        .await
        .unwrap();
    assert_eq!(
        registry
            .invoke(&counter, "add", vec![json!(3)], vec!["long".into()])
            .await
            .unwrap(),
        json!(8)
    );

    let values = registry
        .get_attributes(&counter, &["Count".into(), "Missing".into(), "Label".into()])
        .await
        .unwrap();
    assert_eq!(
        values,
        vec![Attribute::new("Count", 8), Attribute::new("Label", "hits")]
    );

    let set = registry
        .set_attributes(
            &counter,
            vec![Attribute::new("Count", 1), Attribute::new("Label", "nope")],
        )
        .await
        .unwrap();
    assert_eq!(set, vec![Attribute::new("Count", 1)]);

    let err = registry.invoke(&counter, "explode", vec![], vec![]).await;
    assert!(matches!(
        err,
        Err(Error::Management(ManagementError::OperationNotFound(_)))
    ));
}

#[tokio::test]
async fn test_registry_queries() {
    let (registry, _) = registry();

    assert_eq!(registry.resource_count().await.unwrap(), 2);
    assert_eq!(registry.default_domain().await.unwrap(), "mqmx");
    assert_eq!(registry.domains().await.unwrap(), vec!["events", "mqmx"]);

    let counters = registry
        .query_names(Some(&name("mqmx:type=Counter,*")))
        .await
        .unwrap();
    assert_eq!(counters, vec![name("mqmx:type=Counter,name=hits")]);

    let all = registry.query_resources(None).await.unwrap();
    assert_eq!(all.len(), 2);

    let counter = name("mqmx:name=hits,type=Counter");
    assert!(registry.is_registered(&counter).await.unwrap());
    assert!(registry.is_instance_of(&counter, COUNTER_TYPE).await.unwrap());
    assert!(registry
        .is_instance_of(&counter, "mqmx.sample.CounterMBean")
        .await
        .unwrap());
    assert_eq!(
        registry.object_instance(&counter).await.unwrap().type_name,
        COUNTER_TYPE
    );
    assert_eq!(
        registry.resource_info(&counter).await.unwrap().operations.len(),
        3
    );

    registry.unregister(&counter).await.unwrap();
    assert!(!registry.is_registered(&counter).await.unwrap());
    assert!(registry.unregister(&counter).await.is_err());
}

#[test]
fn test_register_rejects_duplicates_and_patterns() {
    let (registry, _) = registry();
    assert!(matches!(
        registry.register(name("mqmx:name=hits,type=Counter"), Arc::new(Counter::new("x"))),
        Err(ManagementError::InstanceAlreadyExists(_))
    ));
    assert!(registry
        .register(name("mqmx:*"), Arc::new(Counter::new("x")))
        .is_err());
}

#[tokio::test]
async fn test_registry_notification_listeners() {
    let (registry, emitter) = registry();
    let events = name("events:type=Emitter");
    let (listener, count) = counting_listener();

    registry
        .add_notification_listener(&events, listener.clone(), None, None)
        .await
        .unwrap();
    emitter.emit("one");
    emitter.emit_opaque("two");
    assert_eq!(count.load(Ordering::SeqCst), 2);

    registry
        .remove_notification_listener(&events, &listener)
        .await
        .unwrap();
    emitter.emit("three");
    assert_eq!(count.load(Ordering::SeqCst), 2);

    let err = registry
        .remove_notification_listener(&events, &listener)
        .await;
    assert!(matches!(
        err,
        Err(Error::Management(ManagementError::ListenerNotFound(_)))
    ));

    // Counters do not broadcast
    let err = registry
        .add_notification_listener(&name("mqmx:type=Counter,name=hits"), listener, None, None)
        .await;
    assert!(matches!(
        err,
        Err(Error::Management(ManagementError::NotBroadcaster(_)))
    ));
}
