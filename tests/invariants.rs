//! Cross-module invariants (spec §8, P1/P7/P8): properties that must hold
//! regardless of which unit exercises them. Counterparts to P2-P6 already
//! live as unit tests next to the code they cover (`auth::tests`,
//! `volume::tests`, `proxy::rewrite::tests`).

mod support;

use std::sync::Arc;

use chrono::Utc;
use mngr::engine::Engine;
use mngr::models::{AgentRecord, AgentState, HostRef};
use mngr::primitives::{AgentId, AgentName, HostId, HostName, ProviderInstanceName};
use mngr::store::AgentStore;

use support::MockHost;

fn sample_record(name: &str) -> AgentRecord {
    AgentRecord {
        id: AgentId::new_random(),
        name: AgentName::new(name).unwrap(),
        agent_type: "generic".to_string(),
        command: "sleep 9999".to_string(),
        work_dir: "/tmp/repo".to_string(),
        create_time: Utc::now(),
        labels: Default::default(),
        start_on_boot: false,
        host_ref: HostRef {
            host_id: HostId::new_random(),
            host_name: HostName::new("alpha").unwrap(),
            provider_name: ProviderInstanceName::new("local").unwrap(),
        },
        state: AgentState::Waiting,
    }
}

/// P1: a reader racing a writer on the same agent never observes a partial
/// document, because every write lands via temp-file-then-rename.
#[tokio::test]
async fn concurrent_write_and_read_never_observes_a_partial_document() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(AgentStore::new(dir.path()));
    let mut record = sample_record("race");
    store.write_agent(&record).await.unwrap();

    let writer_store = store.clone();
    let writer_id = record.id.clone();
    let writer = tokio::spawn(async move {
        for i in 0..50 {
            let mut record = writer_store.read_agent(&writer_id).await.unwrap();
            record.labels.insert("iteration".to_string(), i.to_string());
            writer_store.write_agent(&record).await.unwrap();
        }
    });

    let reader_store = store.clone();
    let reader_id = record.id.clone();
    let reader = tokio::spawn(async move {
        for _ in 0..50 {
            // A successful read must always deserialize: a torn write would
            // surface as a JSON parse error here.
            reader_store.read_agent(&reader_id).await.unwrap();
        }
    });

    writer.await.unwrap();
    reader.await.unwrap();

    record = store.read_agent(&record.id).await.unwrap();
    assert_eq!(record.name.as_str(), "race");
}

/// P7: after a rename, the old name no longer resolves, the new name
/// resolves to the same id, and the multiplexer session carries the new
/// name.
#[tokio::test]
async fn rename_updates_resolution_and_session_name() {
    let dir = tempfile::tempdir().unwrap();
    let store = AgentStore::new(dir.path());
    let record = sample_record("before");
    store.write_agent(&record).await.unwrap();

    let host = Arc::new(MockHost::new(dir.path()));
    host.create_session("mngr-before").await;

    let engine = Engine::new(AgentStore::new(dir.path()), support::noop_backend(), "mngr-");
    engine.rename(&record.id, "after", host.clone()).await.unwrap();

    let store = AgentStore::new(dir.path());
    assert!(store.resolve_by_name_or_id("before").await.is_err());
    let renamed = store.resolve_by_name_or_id("after").await.unwrap();
    assert_eq!(renamed.id, record.id);
    assert!(host.session_exists("mngr-after").await);
}

/// P8: a corrupt or missing `data.json` is skipped, not fatal, and the rest
/// of the directory still lists.
#[tokio::test]
async fn list_agents_skips_corrupt_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store = AgentStore::new(dir.path());

    let good = sample_record("good");
    store.write_agent(&good).await.unwrap();

    let bad_dir = dir.path().join("agents").join("agent-0000000000000000000000000000dead");
    tokio::fs::create_dir_all(&bad_dir).await.unwrap();
    tokio::fs::write(bad_dir.join("data.json"), b"not json").await.unwrap();

    let missing_dir = dir.path().join("agents").join("agent-0000000000000000000000000000beef");
    tokio::fs::create_dir_all(&missing_dir).await.unwrap();

    let agents = store.list_agents().await.unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name.as_str(), "good");
}

