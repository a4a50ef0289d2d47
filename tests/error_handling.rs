//! Failure-path tests: reducer errors, cancellation, timeouts and durable
//! store recovery.

mod common;

use common::{append, complete, engine, registry};
use folio::{
    Action, CancelToken, ConsistencyToken, Engine, EngineConfig, EngineError, FileKeyframeStore,
    FileOperationStore, FileStoreConfig, InternalHub, JobStatus, OperationStore, StreamId,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn durable_engine(dir: &TempDir) -> Arc<Engine> {
    let operations = FileOperationStore::open_or_create(FileStoreConfig {
        path: dir.path().join("store"),
        sync_interval: 1,
        create_if_missing: true,
    })
    .unwrap();
    let keyframes = FileKeyframeStore::new(dir.path().join("keyframes")).unwrap();

    Engine::new(
        EngineConfig::default(),
        registry(),
        Arc::new(operations),
        Arc::new(keyframes),
        InternalHub::new(),
    )
}

#[test]
fn test_reducer_error_reported_with_history() {
    let engine = engine();
    complete(&engine, engine.create_document("doc-1", "test/list", None).unwrap());

    let job = engine
        .mutate("doc-1", vec![Action::new("FAIL", "global", json!({}))])
        .unwrap();
    let info = engine
        .wait_for_job(job, Some(Duration::from_secs(10)), None)
        .unwrap();

    assert_eq!(info.status, JobStatus::Failed);
    let error = info.error.unwrap();
    assert!(error.message.contains("FAIL"));
    assert_eq!(info.error_history.len(), 1);

    // Nothing was written to the stream.
    let stream = StreamId::new("doc-1", "global", "main");
    assert_eq!(
        engine.operations().head_revision(&stream).unwrap(),
        None
    );

    // The stream remains writable afterward.
    complete(&engine, engine.mutate("doc-1", vec![append("ok")]).unwrap());
    engine.shutdown();
}

#[test]
fn test_failed_job_not_resumed() {
    let engine = engine();
    complete(&engine, engine.create_document("doc-1", "test/list", None).unwrap());

    let job = engine
        .mutate("doc-1", vec![Action::new("FAIL", "global", json!({}))])
        .unwrap();
    let first = engine
        .wait_for_job(job, Some(Duration::from_secs(10)), None)
        .unwrap();
    assert_eq!(first.status, JobStatus::Failed);

    // Status stays terminal on re-inspection.
    let second = engine.get_job_status(job).unwrap();
    assert_eq!(second.status, JobStatus::Failed);

    engine.shutdown();
}

#[test]
fn test_wait_for_job_timeout_and_abort() {
    let engine = engine();

    // A job id that never existed resolves to a typed error, not a hang.
    assert!(matches!(
        engine.wait_for_job(folio::JobId(4242), Some(Duration::from_millis(20)), None),
        Err(EngineError::JobNotFound(_))
    ));

    // Consistency waits time out and abort with typed errors.
    let token = ConsistencyToken::single(StreamId::new("ghost", "global", "main"), 3);
    assert!(matches!(
        engine.wait_for(&token, Some(Duration::from_millis(40)), None),
        Err(EngineError::Timeout)
    ));

    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(matches!(
        engine.wait_for(&token, Some(Duration::from_secs(5)), Some(&cancel)),
        Err(EngineError::Aborted)
    ));

    engine.shutdown();
}

#[test]
fn test_unknown_document_read_is_typed() {
    let engine = engine();
    assert!(matches!(
        engine.get_document("nope"),
        Err(EngineError::DocumentNotFound(_))
    ));
    engine.shutdown();
}

#[test]
fn test_durable_store_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let engine = durable_engine(&dir);
        complete(&engine, engine.create_document("doc-1", "test/list", None).unwrap());
        for i in 0..25 {
            complete(&engine, engine.mutate("doc-1", vec![append(i)]).unwrap());
        }
        engine.shutdown();
    }

    // A fresh engine over the same directory rebuilds from the log (and
    // whatever keyframes were flushed).
    let engine = durable_engine(&dir);
    let document = engine
        .get_state("doc-1", "global", "main", Some(24), None)
        .unwrap();
    let items = document.state["items"].as_array().unwrap();
    assert_eq!(items.len(), 25);
    assert_eq!(items[24], json!(24));

    // And stays writable at the recovered head.
    complete(&engine, engine.mutate("doc-1", vec![append("post")]).unwrap());
    let document = engine.get_document("doc-1").unwrap();
    assert_eq!(
        document.state["items"].as_array().unwrap().len(),
        26
    );

    engine.shutdown();
}

#[test]
fn test_queue_blocked_during_shutdown() {
    let engine = engine();
    complete(&engine, engine.create_document("doc-1", "test/list", None).unwrap());
    engine.shutdown();

    assert!(matches!(
        engine.mutate("doc-1", vec![append("late")]),
        Err(EngineError::QueueBlocked)
    ));
}
