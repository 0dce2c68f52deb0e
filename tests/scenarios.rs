//! End-to-end scenarios (spec §8 S1, S5, S6). S2/S3 are covered where the
//! pure functions they exercise live (`proxy::rewrite::tests`); S4 is
//! covered by `auth::tests::code_is_consumed_at_most_once`.

mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mngr::concurrency::ConcurrencyGroup;
use mngr::engine::{CreateAgentOptions, Engine, EnforceParams};
use mngr::models::{HostRecord, HostState};
use mngr::primitives::{AgentId, HostId, HostName, ProviderInstanceName};
use mngr::store::AgentStore;

use support::{noop_backend, MockHost, SingleHostBackend};

fn host_ref(host_id: HostId) -> mngr::models::HostRef {
    mngr::models::HostRef {
        host_id,
        host_name: HostName::new("alpha").unwrap(),
        provider_name: ProviderInstanceName::new("local").unwrap(),
    }
}

/// S1: create, message, destroy.
#[tokio::test]
async fn create_message_destroy_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let host_id = HostId::new_random();
    let host = Arc::new(MockHost::new(dir.path()));
    let engine = Engine::new(AgentStore::new(dir.path()), noop_backend(), "mngr-");

    let record = engine
        .create(
            host_ref(host_id),
            host.clone(),
            CreateAgentOptions {
                name: "test-a".to_string(),
                agent_type: "generic".to_string(),
                command: "sleep 9999".to_string(),
                work_dir: "/tmp/repo".to_string(),
                message: Some("hello".to_string()),
                labels: Default::default(),
                start_on_boot: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(record.name.as_str(), "test-a");
    assert!(host.session_exists("mngr-test-a").await);

    let data_path = dir
        .path()
        .join("agents")
        .join(record.id.as_str())
        .join("data.json");
    assert!(data_path.exists());

    let activity_path = dir
        .path()
        .join("agents")
        .join(record.id.as_str())
        .join("activity")
        .join("ssh");
    assert!(!activity_path.exists(), "no attach has happened yet");

    let deregistered = Arc::new(std::sync::Mutex::new(Vec::<AgentId>::new()));
    let deregistered_clone = deregistered.clone();
    engine
        .destroy(&record.id, host.clone(), move |id| {
            let deregistered = deregistered_clone.clone();
            let id = id.clone();
            Box::pin(async move {
                deregistered.lock().unwrap().push(id);
                Ok(())
            })
        })
        .await
        .unwrap();

    assert!(!data_path.exists());
    assert_eq!(deregistered.lock().unwrap().as_slice(), &[record.id.clone()]);
}

/// S5: rename idempotence. A prior attempt that updated `data.json` but
/// crashed before renaming the multiplexer session must be safely retried.
#[tokio::test]
async fn rename_retries_after_a_simulated_partial_failure() {
    let dir = tempfile::tempdir().unwrap();
    let store = AgentStore::new(dir.path());
    let host_id = HostId::new_random();
    let host = Arc::new(MockHost::new(dir.path()));
    let engine = Engine::new(AgentStore::new(dir.path()), noop_backend(), "mngr-");

    let record = engine
        .create(
            host_ref(host_id),
            host.clone(),
            CreateAgentOptions {
                name: "before".to_string(),
                agent_type: "generic".to_string(),
                command: "sleep 9999".to_string(),
                work_dir: "/tmp/repo".to_string(),
                message: None,
                labels: Default::default(),
                start_on_boot: false,
            },
        )
        .await
        .unwrap();

    // Simulate a prior rename attempt that updated the record but died
    // before renaming the session: data.json already says "after", but the
    // multiplexer session is still "mngr-before".
    let mut partially_renamed = store.read_agent(&record.id).await.unwrap();
    partially_renamed.name = mngr::primitives::AgentName::new("after").unwrap();
    store.write_agent(&partially_renamed).await.unwrap();

    engine.rename(&record.id, "after", host.clone()).await.unwrap();

    assert!(!host.session_exists("mngr-before").await);
    assert!(host.session_exists("mngr-after").await);
    let final_record = store.read_agent(&record.id).await.unwrap();
    assert_eq!(final_record.name.as_str(), "after");
}

/// S6: an idle non-local host is flagged (and, in non-dry-run mode, stopped)
/// once its newest `activity/ssh` mtime exceeds the configured timeout.
#[tokio::test]
async fn enforce_flags_idle_non_local_host() {
    let dir = tempfile::tempdir().unwrap();
    let store = AgentStore::new(dir.path());
    let host_id = HostId::new_random();

    let mut record = mngr::models::AgentRecord {
        id: AgentId::new_random(),
        name: mngr::primitives::AgentName::new("remote-agent").unwrap(),
        agent_type: "generic".to_string(),
        command: "sleep 9999".to_string(),
        work_dir: "/tmp/repo".to_string(),
        create_time: Utc::now(),
        labels: Default::default(),
        start_on_boot: false,
        host_ref: host_ref(host_id.clone()),
        state: mngr::models::AgentState::Running,
    };
    record.host_ref.provider_name = ProviderInstanceName::new("remote").unwrap();
    store.write_agent(&record).await.unwrap();

    let activity_path = store.activity_ssh_path(&record.id);
    tokio::fs::create_dir_all(activity_path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&activity_path, b"{}").await.unwrap();

    let host_record = HostRecord {
        id: host_id.clone(),
        name: HostName::new("remote-1").unwrap(),
        provider_name: ProviderInstanceName::new("remote").unwrap(),
        state: HostState::Running,
        state_since: Utc::now(),
        snapshots: Vec::new(),
        tags: Vec::new(),
        plugin_data: Default::default(),
    };
    let backend = Arc::new(SingleHostBackend::new(host_record));
    let engine = Engine::new(AgentStore::new(dir.path()), backend.clone(), "mngr-");

    tokio::time::sleep(Duration::from_secs(2)).await;

    let cg = ConcurrencyGroup::new();
    let report = engine
        .enforce(
            &cg,
            EnforceParams {
                check_idle: true,
                check_timeouts: false,
                idle_timeout: Duration::from_secs(1),
                building_timeout: Duration::from_secs(3600),
                starting_timeout: Duration::from_secs(3600),
                stopping_timeout: Duration::from_secs(3600),
                dry_run: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(report.idle_violations, vec![host_id]);
    assert!(!report.actions.is_empty());
    assert!(backend.stopped_hosts().is_empty(), "dry-run must not mutate state");
}

/// §4.6: a host stuck BUILDING past its configured timeout is flagged and,
/// outside dry-run, destroyed.
#[tokio::test]
async fn enforce_flags_host_stuck_building_past_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let host_id = HostId::new_random();

    let host_record = HostRecord {
        id: host_id.clone(),
        name: HostName::new("stuck-1").unwrap(),
        provider_name: ProviderInstanceName::new("remote").unwrap(),
        state: HostState::Building,
        state_since: Utc::now() - chrono::Duration::seconds(10),
        snapshots: Vec::new(),
        tags: Vec::new(),
        plugin_data: Default::default(),
    };
    let backend = Arc::new(SingleHostBackend::new(host_record));
    let engine = Engine::new(AgentStore::new(dir.path()), backend.clone(), "mngr-");

    let cg = ConcurrencyGroup::new();
    let report = engine
        .enforce(
            &cg,
            EnforceParams {
                check_idle: false,
                check_timeouts: true,
                idle_timeout: Duration::from_secs(3600),
                building_timeout: Duration::from_secs(1),
                starting_timeout: Duration::from_secs(3600),
                stopping_timeout: Duration::from_secs(3600),
                dry_run: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(report.timeout_violations, vec![host_id]);
    assert!(!report.actions.is_empty());
}
