//! Validator caching, rewriting and fault handling on the authority.

use meshrpc_core::{EntityId, PeerId};
use meshrpc_rpc::{CallOptions, HandlerOutcome, RpcConfig, RpcMetadata, TargetRule};
use meshrpc_testkit::{TestSession, TestEntity, AUTHORITY};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BOARD: EntityId = EntityId(3);

fn session(runs: Arc<AtomicUsize>) -> TestSession {
    TestSession::new(RpcConfig::default(), 2, move |engine| {
        let say = engine.register_rpc::<(String,)>(
            "Board",
            "say",
            RpcMetadata::targeted(TargetRule::All).with_validator("moderate"),
        )?;
        let runs = runs.clone();
        engine.register_validator::<(String,), _>("Board", "moderate", move |ctx, (text,), result| {
            runs.fetch_add(1, Ordering::SeqCst);
            result.allow_all();
            if text.as_str() == "panic" {
                panic!("moderator crashed");
            }
            if text.as_str() == "mute" {
                result.deny_all_with("board is muted");
                return;
            }
            if text.contains("darn") {
                *text = text.replace("darn", "****");
            }
            if let Some(index) = ctx.target_index(PeerId(3)) {
                result.deny_target(index);
                result.set_denial_reason("peer#3 is read-only");
            }
        })?;
        engine.register_handler::<TestEntity, (String,), (), _>(say, |_ctx, board, (text,)| {
            board.record(text);
            Ok(HandlerOutcome::Ready(()))
        })?;
        Ok(())
    })
    .expect("session builds")
}

#[test]
fn scenario_result_is_cached_until_ttl() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut session = session(runs.clone());
    session.spawn_everywhere(BOARD, "Board", AUTHORITY);

    for _ in 0..2 {
        session
            .authority()
            .unwrap()
            .call_rpc_with(BOARD, "say", ("hello".to_string(),), CallOptions::scenario("lobby"))
            .unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let diagnostics = session.authority().unwrap().diagnostics();
    assert_eq!(diagnostics.validation_cache_misses, 1);
    assert_eq!(diagnostics.validation_cache_hits, 1);

    session.advance_time(Duration::from_secs(31));
    session
        .authority()
        .unwrap()
        .call_rpc_with(BOARD, "say", ("hello".to_string(),), CallOptions::scenario("lobby"))
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn cached_denials_still_apply() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut session = session(runs);
    let boards = session.spawn_everywhere(BOARD, "Board", AUTHORITY);

    for _ in 0..2 {
        let summary = session
            .authority()
            .unwrap()
            .call_rpc_with(BOARD, "say", ("hi".to_string(),), CallOptions::scenario("lobby"))
            .unwrap();
        assert_eq!(summary.denied, vec![PeerId(3)]);
        let report = summary.report.unwrap();
        assert_eq!(report.failure_reason.as_deref(), Some("peer#3 is read-only"));
    }
    session.step();
    assert_eq!(boards[&PeerId(2)].calls(), vec!["hi", "hi"]);
    assert!(boards[&PeerId(3)].calls().is_empty());
}

#[test]
fn rewritten_arguments_reach_targets_and_skip_cache() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut session = session(runs.clone());
    let boards = session.spawn_everywhere(BOARD, "Board", AUTHORITY);

    for _ in 0..2 {
        let summary = session
            .authority()
            .unwrap()
            .call_rpc_with(BOARD, "say", ("darn it".to_string(),), CallOptions::scenario("lobby"))
            .unwrap();
        assert!(summary.report.unwrap().was_modified);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    session.step();
    assert_eq!(boards[&AUTHORITY].calls(), vec!["**** it", "**** it"]);
    assert_eq!(boards[&PeerId(2)].calls(), vec!["**** it", "**** it"]);
}

#[test]
fn panicking_validator_allows_everyone() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut session = session(runs);
    let boards = session.spawn_everywhere(BOARD, "Board", AUTHORITY);

    let summary = session
        .authority()
        .unwrap()
        .call_rpc(BOARD, "say", ("panic".to_string(),))
        .unwrap();
    assert!(summary.denied.is_empty());
    session.step();

    assert_eq!(boards[&PeerId(3)].calls(), vec!["panic"]);
    assert_eq!(session.authority().unwrap().diagnostics().validator_faults, 1);
}

#[test]
fn muted_board_denies_every_target() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut session = session(runs);
    let boards = session.spawn_everywhere(BOARD, "Board", AUTHORITY);

    let summary = session
        .authority()
        .unwrap()
        .call_rpc(BOARD, "say", ("mute".to_string(),))
        .unwrap();
    assert!(!summary.executed_locally);
    assert_eq!(summary.denied, vec![AUTHORITY, PeerId(2), PeerId(3)]);
    assert_eq!(
        summary.report.unwrap().failure_reason.as_deref(),
        Some("board is muted")
    );

    session.step();
    assert!(boards.values().all(|board| board.calls().is_empty()));
}
