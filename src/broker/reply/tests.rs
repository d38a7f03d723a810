use super::*;

#[tokio::test]
async fn test_deliver_reaches_waiter_once() {
    let coordinator = ReplyCoordinator::new();
    let mut waiter = coordinator.register("cid-1").unwrap();

    assert!(coordinator.deliver(Message::new("first").with_correlation_id("cid-1")));
    assert!(!coordinator.deliver(Message::new("second").with_correlation_id("cid-1")));

    let reply = (&mut waiter.reply).await.unwrap();
    assert_eq!(&reply.body[..], b"first");
    assert_eq!(coordinator.pending(), 0);
}

#[tokio::test]
async fn test_unknown_reply_is_dropped() {
    let coordinator = ReplyCoordinator::new();
    assert!(!coordinator.deliver(Message::new("late").with_correlation_id("nobody")));
    assert!(!coordinator.contains("nobody"));
    assert_eq!(coordinator.pending(), 0);
}

#[tokio::test]
async fn test_reply_without_correlation_id_is_dropped() {
    let coordinator = ReplyCoordinator::new();
    let _waiter = coordinator.register("cid-1").unwrap();

    assert!(!coordinator.deliver(Message::new("anonymous")));
    assert!(coordinator.contains("cid-1"));
}

#[test]
fn test_duplicate_registration_rejected() {
    let coordinator = ReplyCoordinator::new();
    let _waiter = coordinator.register("cid-1").unwrap();

    assert!(matches!(
        coordinator.register("cid-1"),
        Err(BrokerError::DuplicateCorrelationId(ref id)) if id == "cid-1"
    ));
}

#[test]
fn test_dropping_waiter_removes_entry() {
    let coordinator = ReplyCoordinator::new();
    {
        let _waiter = coordinator.register("cid-1").unwrap();
        assert!(coordinator.contains("cid-1"));
    }
    assert!(!coordinator.contains("cid-1"));
}

#[test]
fn test_abandon_after_delivery_reports_taken() {
    let coordinator = ReplyCoordinator::new();
    let waiter = coordinator.register("cid-1").unwrap();

    assert!(coordinator.deliver(Message::new("r").with_correlation_id("cid-1")));
    assert!(!waiter.abandon());
}

#[test]
fn test_stale_waiter_does_not_remove_newer_registration() {
    let coordinator = ReplyCoordinator::new();
    let first = coordinator.register("cid-1").unwrap();
    assert!(first.abandon());

    let _second = coordinator.register("cid-1").unwrap();
    drop(first);
    assert!(coordinator.contains("cid-1"));
}

#[tokio::test]
async fn test_clear_closes_waiters() {
    let coordinator = ReplyCoordinator::new();
    let mut waiter = coordinator.register("cid-1").unwrap();
    let _ = coordinator.route("replies");

    coordinator.clear();

    assert!((&mut waiter.reply).await.is_err());
    assert!(!coordinator.has_route("replies"));
}

#[test]
fn test_route_created_once() {
    let coordinator = ReplyCoordinator::new();

    let first = coordinator.route("replies");
    let second = coordinator.route("replies");

    assert!(matches!(first, RouteEntry::Created { .. }));
    assert!(matches!(second, RouteEntry::Existing(_)));
}

#[tokio::test]
async fn test_route_failure_broadcast_and_entry_removed() {
    let coordinator = ReplyCoordinator::new();
    let RouteEntry::Created { id, state, .. } = coordinator.route("replies") else {
        panic!("expected a new route");
    };
    let RouteEntry::Existing(mut watcher) = coordinator.route("replies") else {
        panic!("expected an existing route");
    };

    coordinator.route_failed("replies", id, &state, "no consumer".to_string());

    watcher.changed().await.unwrap();
    assert_eq!(
        *watcher.borrow(),
        RouteState::Failed("no consumer".to_string())
    );
    assert!(!coordinator.has_route("replies"));
    assert!(matches!(coordinator.route("replies"), RouteEntry::Created { .. }));
}

#[test]
fn test_route_failure_keeps_newer_route() {
    let coordinator = ReplyCoordinator::new();
    let RouteEntry::Created { id, state, .. } = coordinator.route("replies") else {
        panic!("expected a new route");
    };
    coordinator.clear();
    let _newer = coordinator.route("replies");

    coordinator.route_failed("replies", id, &state, "stale".to_string());

    assert!(coordinator.has_route("replies"));
}

#[tokio::test]
async fn test_dispatcher_delivers_event_message() {
    let coordinator = Arc::new(ReplyCoordinator::new());
    let mut waiter = coordinator.register("cid-9").unwrap();
    let dispatcher = ReplyDispatcher {
        coordinator: Arc::clone(&coordinator),
    };

    dispatcher
        .handle(Event::new(
            "square.request.reply",
            Message::new("49").with_correlation_id("cid-9"),
        ))
        .await
        .unwrap();

    assert_eq!(&(&mut waiter.reply).await.unwrap().body[..], b"49");
}
