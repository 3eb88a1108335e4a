use docmesh_storage::{KeyValueStore, MemoryKeyValueStore};
use docmesh_sync::acceptance::{
    OPTION_ACCEPT, OPTION_ACCEPT_TEMPORARILY, OPTION_DENY, OPTION_DENY_TEMPORARILY, OPTION_IGNORE,
    compile_patterns, matches_list,
};
use docmesh_sync::settings::{MemorySettingsSource, ReplicatorSettings};
use docmesh_sync::{AcceptanceModel, Capabilities, Decision};
use docmesh_types::PeerId;
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::ScriptedConfirm;

fn interactive() -> ReplicatorSettings {
    ReplicatorSettings {
        headless: false,
        prompt_timeout_ms: 1_000,
        ..Default::default()
    }
}

fn model(
    settings: ReplicatorSettings,
    confirm: Arc<ScriptedConfirm>,
) -> (AcceptanceModel, Arc<MemoryKeyValueStore>) {
    let kv = Arc::new(MemoryKeyValueStore::new());
    let caps = Capabilities::new(
        confirm,
        kv.clone(),
        Arc::new(MemorySettingsSource::new(settings)),
    );
    (AcceptanceModel::new(caps), kv)
}

fn peer(id: &str) -> PeerId {
    PeerId::from_string(id)
}

// ── Lists ───────────────────────────────────────────────────────

#[test]
fn pattern_lists_skip_blank_and_invalid_entries() {
    assert_eq!(compile_patterns(" laptop , ,phone-.*, (unclosed").len(), 2);
    assert!(matches_list("laptop, phone-.*", "phone-7"));
    assert!(!matches_list("", "anything"));
}

#[tokio::test]
async fn deny_list_wins_without_prompting() {
    let confirm = ScriptedConfirm::answering(Some(OPTION_ACCEPT));
    let (model, _) = model(
        ReplicatorSettings {
            allow_list: ".*".into(),
            deny_list: "laptop".into(),
            ..interactive()
        },
        confirm.clone(),
    );

    assert!(!model.is_accepted(&peer("p1"), "laptop").await);
    assert!(model.is_accepted(&peer("p2"), "desktop").await);
    assert_eq!(confirm.calls(), 0);
}

#[tokio::test]
async fn headless_denies_unknown_peers() {
    let confirm = ScriptedConfirm::answering(Some(OPTION_ACCEPT));
    let (model, _) = model(
        ReplicatorSettings {
            headless: true,
            ..Default::default()
        },
        confirm.clone(),
    );

    assert!(!model.is_accepted(&peer("p1"), "laptop").await);
    assert_eq!(confirm.calls(), 0);
}

// ── Prompting ───────────────────────────────────────────────────

#[tokio::test]
async fn accepted_by_name_survives_new_peer_ids() {
    let confirm = ScriptedConfirm::answering(Some(OPTION_ACCEPT));
    let (model, kv) = model(interactive(), confirm.clone());

    assert!(model.is_accepted(&peer("p1"), "laptop").await);
    assert!(model.is_accepted(&peer("p9"), "laptop").await);

    assert_eq!(confirm.calls(), 1);
    assert_eq!(model.persisted_decision("laptop"), Some(Decision::Accepted));
    assert!(kv.get("peer-acceptance/laptop").unwrap().is_some());
}

#[tokio::test]
async fn persisted_denial_is_remembered() {
    let confirm = ScriptedConfirm::answering(Some(OPTION_DENY));
    let (model, _) = model(interactive(), confirm.clone());

    assert!(!model.is_accepted(&peer("p1"), "laptop").await);
    assert!(!model.is_accepted(&peer("p2"), "laptop").await);
    assert_eq!(confirm.calls(), 1);
}

#[tokio::test]
async fn temporary_decisions_are_per_peer_id() {
    let confirm = ScriptedConfirm::answering(Some(OPTION_ACCEPT_TEMPORARILY));
    let (model, _) = model(interactive(), confirm.clone());

    assert!(model.is_accepted(&peer("p1"), "laptop").await);
    assert!(model.is_accepted(&peer("p1"), "laptop").await);
    assert_eq!(confirm.calls(), 1);
    assert_eq!(model.persisted_decision("laptop"), None);

    confirm.set_choice(Some(OPTION_DENY_TEMPORARILY));
    assert!(!model.is_accepted(&peer("p2"), "laptop").await);
    assert_eq!(confirm.calls(), 2);
    assert_eq!(model.session_decision(&peer("p2")), Some(Decision::Denied));

    model.clear_session();
    assert_eq!(model.session_decision(&peer("p1")), None);
}

#[tokio::test]
async fn ignored_prompt_denies_without_remembering() {
    let confirm = ScriptedConfirm::answering(Some(OPTION_IGNORE));
    let (model, _) = model(interactive(), confirm.clone());

    assert!(!model.is_accepted(&peer("p1"), "laptop").await);
    assert!(!model.is_accepted(&peer("p1"), "laptop").await);
    assert_eq!(confirm.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn unanswered_prompt_times_out_as_deny() {
    let confirm = ScriptedConfirm::slow(Some(OPTION_ACCEPT), Duration::from_secs(3600));
    let (model, _) = model(interactive(), confirm.clone());

    assert!(!model.is_accepted(&peer("p1"), "laptop").await);
    assert_eq!(model.persisted_decision("laptop"), None);
    assert_eq!(model.session_decision(&peer("p1")), None);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_prompt() {
    let confirm = ScriptedConfirm::slow(Some(OPTION_ACCEPT), Duration::from_millis(200));
    let (model, _) = model(interactive(), confirm.clone());

    let (p1, p2) = (peer("p1"), peer("p2"));
    let (first, second) = tokio::join!(
        model.is_accepted(&p1, "laptop"),
        model.is_accepted(&p2, "laptop"),
    );

    assert!(first && second);
    assert_eq!(confirm.calls(), 1);
}

#[tokio::test]
async fn revoke_forgets_the_name() {
    let confirm = ScriptedConfirm::answering(Some(OPTION_ACCEPT));
    let (model, _) = model(interactive(), confirm.clone());
    assert!(model.is_accepted(&peer("p1"), "laptop").await);

    model.revoke("laptop");
    confirm.set_choice(None);

    assert_eq!(model.persisted_decision("laptop"), None);
    assert!(!model.is_accepted(&peer("p1"), "laptop").await);
    assert_eq!(confirm.calls(), 2);
}
