//! Sync manager, mailbox and channel tests, including two engines
//! synchronizing over the in-process transport.

mod common;

use common::{append, complete, engine, registry, wait_until};
use folio::{
    ChannelConfig, Engine, EngineConfig, EngineError, InternalHub, Mailbox, ModelRegistry,
    OperationStore, RemoteFilter, SyncDirection, SyncOperation, SyncOperationStatus,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn paired_engines() -> (Arc<Engine>, Arc<Engine>, Arc<InternalHub>) {
    let hub = InternalHub::new();
    let a = Engine::new(
        EngineConfig::default(),
        registry(),
        Arc::new(folio::MemoryOperationStore::new()),
        Arc::new(folio::MemoryKeyframeStore::new()),
        Arc::clone(&hub) as Arc<dyn folio::ChannelFactory>,
    );
    let b = Engine::new(
        EngineConfig::default(),
        registry(),
        Arc::new(folio::MemoryOperationStore::new()),
        Arc::new(folio::MemoryKeyframeStore::new()),
        Arc::clone(&hub) as Arc<dyn folio::ChannelFactory>,
    );
    (a, b, hub)
}

#[test]
fn test_mailbox_delivery_guarantee() {
    let mailbox = Mailbox::new();
    let invoked = Arc::new(AtomicUsize::new(0));

    // Callbacks 1 and 3 throw; all four must still see the item, and the
    // aggregate carries exactly the two errors in registration order.
    for (position, fails) in [(1, true), (2, false), (3, true), (4, false)] {
        let invoked = Arc::clone(&invoked);
        mailbox.on_added(move |items| {
            assert_eq!(items.len(), 1);
            invoked.fetch_add(1, Ordering::SeqCst);
            if fails {
                Err(EngineError::InvalidOperation(format!("callback {position}")))
            } else {
                Ok(())
            }
        });
    }

    let item = SyncOperation::new(
        "batch-1",
        "peer",
        SyncDirection::Push,
        "doc-1",
        "global",
        "main",
        Vec::new(),
    );
    let result = mailbox.add(vec![item]);

    assert_eq!(invoked.load(Ordering::SeqCst), 4);
    match result {
        Err(EngineError::MailboxAggregate(errors)) => {
            assert_eq!(errors.len(), 2);
            assert!(errors[0].to_string().contains("callback 1"));
            assert!(errors[1].to_string().contains("callback 3"));
        }
        other => panic!("expected mailbox aggregate, got {other:?}"),
    }
}

#[test]
fn test_sync_operation_forward_only() {
    let op = SyncOperation::new(
        "batch-1",
        "peer",
        SyncDirection::Push,
        "doc-1",
        "global",
        "main",
        Vec::new(),
    );

    let notified = Arc::new(AtomicUsize::new(0));
    {
        let notified = Arc::clone(&notified);
        op.on(move |_, _, _| {
            notified.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    op.started().unwrap();
    op.executing().unwrap();
    op.applied().unwrap();
    assert_eq!(notified.load(Ordering::SeqCst), 3);

    // Applied ignores a late started(): status unchanged, nobody notified.
    assert!(!op.started().unwrap());
    assert_eq!(op.status(), SyncOperationStatus::Applied);
    assert_eq!(notified.load(Ordering::SeqCst), 3);

    // An errored handle ignores every subsequent transition.
    let failed = SyncOperation::new(
        "batch-2",
        "peer",
        SyncDirection::Pull,
        "doc-1",
        "global",
        "main",
        Vec::new(),
    );
    failed.failed("boom").unwrap();
    assert!(!failed.started().unwrap());
    assert!(!failed.executing().unwrap());
    assert!(!failed.applied().unwrap());
    assert_eq!(failed.status(), SyncOperationStatus::Error);
}

#[test]
fn test_two_engines_sync_history_and_live_traffic() {
    let (a, b, _hub) = paired_engines();

    // History on A before any remote exists.
    complete(&a, a.create_document("doc-1", "test/list", None).unwrap());
    complete(&a, a.mutate("doc-1", vec![append("old")]).unwrap());

    let filter = RemoteFilter {
        document_ids: vec!["doc-1".into()],
        ..Default::default()
    };

    // B connects first and waits; A's add pairs the endpoints and
    // backfills its outbox from history.
    b.sync()
        .add("from-a", "col-1", ChannelConfig::internal("pair-ab"), filter.clone())
        .unwrap();
    a.sync()
        .add("to-b", "col-1", ChannelConfig::internal("pair-ab"), filter)
        .unwrap();

    wait_until("backfill applied on B", || {
        b.get_document("doc-1")
            .map(|d| d.state["items"] == json!(["old"]))
            .unwrap_or(false)
    });

    // Live traffic flows through the same path.
    complete(&a, a.mutate("doc-1", vec![append("new")]).unwrap());
    wait_until("live op applied on B", || {
        b.get_document("doc-1")
            .map(|d| d.state["items"] == json!(["old", "new"]))
            .unwrap_or(false)
    });

    // B applied through the job pipeline: its own store agrees.
    let page = b
        .operations()
        .get_since(
            &folio::StreamId::new("doc-1", "global", "main"),
            None,
            None,
            None,
            None,
        )
        .unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[1].index, 1);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_inbox_failure_dead_letters_without_retry() {
    let hub = InternalHub::new();
    let a = Engine::new(
        EngineConfig::default(),
        registry(),
        Arc::new(folio::MemoryOperationStore::new()),
        Arc::new(folio::MemoryKeyframeStore::new()),
        Arc::clone(&hub) as Arc<dyn folio::ChannelFactory>,
    );
    // B has no registered model, so applying A's operations fails.
    let b = Engine::new(
        EngineConfig::default(),
        Arc::new(ModelRegistry::new()),
        Arc::new(folio::MemoryOperationStore::new()),
        Arc::new(folio::MemoryKeyframeStore::new()),
        Arc::clone(&hub) as Arc<dyn folio::ChannelFactory>,
    );

    let filter = RemoteFilter {
        document_ids: vec!["doc-1".into()],
        ..Default::default()
    };
    b.sync()
        .add("from-a", "col-1", ChannelConfig::internal("pair"), filter.clone())
        .unwrap();
    a.sync()
        .add("to-b", "col-1", ChannelConfig::internal("pair"), filter)
        .unwrap();

    complete(&a, a.create_document("doc-1", "test/list", None).unwrap());

    let remote = b.sync().get("from-a").unwrap();
    wait_until("batch dead-lettered on B", || {
        remote.channel.dead_letter().len() == 1
    });

    let parked = remote.channel.dead_letter().items().remove(0);
    assert_eq!(parked.status(), SyncOperationStatus::Error);
    assert!(parked.error().is_some());

    // Not retried automatically.
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(remote.channel.dead_letter().len(), 1);
    assert!(b.get_document("doc-1").is_err());

    // Operator-driven re-delivery: once the model is available, draining
    // the dead-letter mailbox re-applies the batch through the pipeline.
    b.registry()
        .register(Arc::new(common::ListModel))
        .unwrap();
    assert_eq!(b.sync().redeliver_dead_letters("from-a").unwrap(), 1);

    wait_until("redelivered batch applied on B", || {
        b.get_document("doc-1").is_ok()
    });
    assert!(remote.channel.dead_letter().is_empty());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_source_remote_not_routed_back() {
    let (a, b, _hub) = paired_engines();

    let filter = RemoteFilter {
        document_ids: vec!["doc-1".into()],
        ..Default::default()
    };
    b.sync()
        .add("from-a", "col-1", ChannelConfig::internal("pair"), filter.clone())
        .unwrap();
    a.sync()
        .add("to-b", "col-1", ChannelConfig::internal("pair"), filter)
        .unwrap();

    complete(&a, a.create_document("doc-1", "test/list", None).unwrap());
    complete(&a, a.mutate("doc-1", vec![append(1)]).unwrap());

    wait_until("applied on B", || {
        b.get_document("doc-1")
            .map(|d| d.state["items"] == json!([1]))
            .unwrap_or(false)
    });

    // B's apply is tagged with the source remote, so it is not echoed back
    // into B's outbox toward A; both dead-letter boxes stay empty.
    let remote_a = a.sync().get("to-b").unwrap();
    let remote_b = b.sync().get("from-a").unwrap();
    wait_until("outboxes drained", || {
        remote_a.channel.outbox().is_empty() && remote_b.channel.outbox().is_empty()
    });
    assert!(remote_a.channel.dead_letter().is_empty());
    assert!(remote_b.channel.dead_letter().is_empty());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_remote_management() {
    let engine = engine();

    let added = engine
        .sync()
        .add(
            "peer",
            "col-1",
            ChannelConfig::internal("solo"),
            RemoteFilter::default(),
        )
        .unwrap();
    assert_eq!(added.name, "peer");

    assert!(matches!(
        engine.sync().add(
            "peer",
            "col-1",
            ChannelConfig::internal("solo-2"),
            RemoteFilter::default()
        ),
        Err(EngineError::RemoteExists(_))
    ));

    assert_eq!(engine.sync().list().len(), 1);
    engine.sync().remove("peer").unwrap();
    assert!(matches!(
        engine.sync().get("peer"),
        Err(EngineError::RemoteNotFound(_))
    ));

    engine.shutdown();
}
