#![cfg(feature = "memory")]

use foldback_core::{CheckpointId, CoreError, NewEntry, Role, Sequence, SessionState};
use foldback_session::{ManagerError, SessionManager, storage::MemoryStorage};

fn manager() -> SessionManager<MemoryStorage> {
    SessionManager::new(MemoryStorage::new())
}

fn core_error(err: ManagerError) -> CoreError {
    match err {
        ManagerError::Core(e) => e,
        other => panic!("expected core error, got {other}"),
    }
}

async fn sequences(manager: &SessionManager<MemoryStorage>, id: uuid::Uuid) -> Vec<Sequence> {
    manager
        .entries_from(id, 0)
        .await
        .unwrap()
        .iter()
        .map(|e| e.sequence)
        .collect()
}

#[tokio::test]
async fn fold_replaces_everything_after_the_marker() {
    let manager = manager();
    let root = manager.create_root().await.unwrap();
    manager.append(root, NewEntry::user("fix the bug")).await.unwrap();
    manager.append(root, NewEntry::tool_call("cat main.rs")).await.unwrap();
    let cp = manager.checkpoint(root).await.unwrap();
    manager.append(root, NewEntry::tool_result("20k lines")).await.unwrap();
    manager.append(root, NewEntry::agent("patched it")).await.unwrap();
    assert_eq!(cp.position, 3);

    let outcome = manager
        .revert(root, cp.id, "fixed bug, no need to redo")
        .await
        .unwrap();

    assert_eq!(outcome.fold_sequence, 6);
    assert_eq!(sequences(&manager, root).await, vec![1, 2, 3, 6]);
    let entries = manager.entries_from(root, 6).await.unwrap();
    assert_eq!(entries[0].role, Role::Agent);
    assert_eq!(entries[0].text(), Some("fixed bug, no need to redo"));
}

#[tokio::test]
async fn checkpoint_ids_are_never_reused() {
    let manager = manager();
    let root = manager.create_root().await.unwrap();
    let first = manager.checkpoint(root).await.unwrap();

    let mut seen = vec![first.id];
    for round in 0..5 {
        manager
            .append(root, NewEntry::tool_call(format!("call {round}")))
            .await
            .unwrap();
        let later = manager.checkpoint(root).await.unwrap();
        assert!(!seen.contains(&later.id));
        seen.push(later.id);
        manager.revert(root, first.id, format!("fold {round}")).await.unwrap();
    }

    let valid = manager.valid_checkpoints(root).await.unwrap();
    assert_eq!(valid.len(), 1);
    assert_eq!(valid[0].id, first.id);
}

#[tokio::test]
async fn invalidation_splits_at_the_cut() {
    let manager = manager();
    let root = manager.create_root().await.unwrap();
    let a = manager.checkpoint(root).await.unwrap();
    manager.append(root, NewEntry::user("one")).await.unwrap();
    let b = manager.checkpoint(root).await.unwrap();
    manager.append(root, NewEntry::user("two")).await.unwrap();
    let c = manager.checkpoint(root).await.unwrap();
    manager.append(root, NewEntry::user("three")).await.unwrap();
    let d = manager.checkpoint(root).await.unwrap();

    let outcome = manager.revert(root, b.id, "fold").await.unwrap();
    assert_eq!(outcome.invalidated, vec![c.id, d.id]);

    let valid = manager.valid_checkpoints(root).await.unwrap();
    assert_eq!(valid, vec![a, b]);
}

#[tokio::test]
async fn reverting_to_an_invalidated_checkpoint_fails() {
    let manager = manager();
    let root = manager.create_root().await.unwrap();
    let c2 = manager.checkpoint(root).await.unwrap();
    manager.append(root, NewEntry::user("work")).await.unwrap();
    let c1 = manager.checkpoint(root).await.unwrap();
    manager.append(root, NewEntry::user("more work")).await.unwrap();

    manager.revert(root, c1.id, "later fold").await.unwrap();
    manager.revert(root, c2.id, "earlier fold").await.unwrap();

    let before = manager.snapshot(root).await.unwrap();
    let err = manager.revert(root, c1.id, "stale").await.unwrap_err();
    assert_eq!(core_error(err), CoreError::UnknownCheckpoint(c1.id));
    assert_eq!(manager.snapshot(root).await.unwrap(), before);
}

#[tokio::test]
async fn foreign_and_unissued_checkpoints_are_rejected() {
    let manager = manager();
    let root = manager.create_root().await.unwrap();
    let other = manager.create_root().await.unwrap();
    manager.checkpoint(other).await.unwrap();
    manager.checkpoint(other).await.unwrap();
    manager.checkpoint(root).await.unwrap();

    let err = manager.revert(root, CheckpointId(1), "fold").await.unwrap_err();
    assert_eq!(core_error(err), CoreError::UnknownCheckpoint(CheckpointId(1)));
}

#[tokio::test]
async fn invalid_fold_is_rejected_without_change() {
    let manager = manager();
    let root = manager.create_root().await.unwrap();
    let cp = manager.checkpoint(root).await.unwrap();
    manager.append(root, NewEntry::user("keep me")).await.unwrap();
    let before = manager.snapshot(root).await.unwrap();

    let err = manager.revert(root, cp.id, "  \n ").await.unwrap_err();
    assert_eq!(err.code(), "invalid_fold_content");
    assert_eq!(manager.snapshot(root).await.unwrap(), before);
}

#[tokio::test]
async fn child_spawned_after_the_checkpoint_is_detached() {
    let manager = manager();
    let root = manager.create_root().await.unwrap();
    manager.append(root, NewEntry::user("plan")).await.unwrap();
    let cp = manager.checkpoint(root).await.unwrap();
    manager.append(root, NewEntry::tool_call("delegate")).await.unwrap();
    manager.append(root, NewEntry::agent("waiting")).await.unwrap();
    assert_eq!(cp.position, 2);

    let s2 = manager.spawn_child(root).await.unwrap();
    manager.append(s2, NewEntry::agent("half done")).await.unwrap();

    let outcome = manager.revert(root, cp.id, "not needed").await.unwrap();
    assert_eq!(outcome.detached, vec![s2]);

    assert!(manager.children(root).await.unwrap().is_empty());
    assert_eq!(manager.state(s2).await.unwrap(), SessionState::Terminated);

    let err = manager.complete(s2).await.unwrap_err();
    assert_eq!(core_error(err), CoreError::DetachedSessionWrite(s2));
    let err = manager.append(s2, NewEntry::agent("late")).await.unwrap_err();
    assert_eq!(core_error(err), CoreError::DetachedSessionWrite(s2));
}

#[tokio::test]
async fn child_spawned_before_the_checkpoint_survives() {
    let manager = manager();
    let root = manager.create_root().await.unwrap();
    let early = manager.spawn_child(root).await.unwrap();
    let cp = manager.checkpoint(root).await.unwrap();
    manager.append(root, NewEntry::user("after")).await.unwrap();

    manager.revert(root, cp.id, "fold").await.unwrap();
    assert_eq!(manager.children(root).await.unwrap(), vec![early]);

    manager.append(early, NewEntry::agent("report")).await.unwrap();
    let summary = manager.complete(early).await.unwrap();
    assert_eq!(summary.text(), Some("report"));
    assert_eq!(manager.state(early).await.unwrap(), SessionState::Completed);
}

#[tokio::test]
async fn parent_revert_leaves_child_log_alone() {
    let manager = manager();
    let root = manager.create_root().await.unwrap();
    let child = manager.spawn_child(root).await.unwrap();
    let child_cp = manager.checkpoint(child).await.unwrap();
    manager.append(child, NewEntry::agent("progress")).await.unwrap();
    let root_cp = manager.checkpoint(root).await.unwrap();
    manager.append(root, NewEntry::user("x")).await.unwrap();

    let before = manager.entries_from(child, 0).await.unwrap();
    manager.revert(root, root_cp.id, "fold").await.unwrap();
    assert_eq!(manager.entries_from(child, 0).await.unwrap(), before);
    assert_eq!(
        manager.valid_checkpoints(child).await.unwrap(),
        vec![child_cp]
    );
}

#[tokio::test]
async fn planner_cannot_forge_markers() {
    let manager = manager();
    let root = manager.create_root().await.unwrap();
    let err = manager
        .append(root, NewEntry::new(Role::SystemMarker, "CHECKPOINT 0"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "reserved_role");
    assert!(manager.valid_checkpoints(root).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_appends_on_separate_sessions() {
    let manager = std::sync::Arc::new(manager());
    let a = manager.create_root().await.unwrap();
    let b = manager.create_root().await.unwrap();

    let mut handles = Vec::new();
    for id in [a, b] {
        for i in 0..20 {
            let manager = std::sync::Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.append(id, NewEntry::user(format!("{i}"))).await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(sequences(&manager, a).await, (1..=20).collect::<Vec<_>>());
    assert_eq!(sequences(&manager, b).await, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn detached_session_rejects_every_mutation() {
    let manager = manager();
    let root = manager.create_root().await.unwrap();
    let cp = manager.checkpoint(root).await.unwrap();
    let child = manager.spawn_child(root).await.unwrap();
    let child_cp = manager.checkpoint(child).await.unwrap();
    manager.append(child, NewEntry::agent("partial")).await.unwrap();

    manager.revert(root, cp.id, "fold").await.unwrap();
    let before = manager.snapshot(child).await.unwrap();

    let detached = CoreError::DetachedSessionWrite(child);
    let err = manager.revert(child, child_cp.id, "undo").await.unwrap_err();
    assert_eq!(core_error(err), detached);
    let err = manager.checkpoint(child).await.unwrap_err();
    assert_eq!(core_error(err), detached);
    let err = manager.spawn_child(child).await.unwrap_err();
    assert_eq!(core_error(err), detached);
    let err = manager
        .stage_revert(child, child_cp.id, "undo later")
        .await
        .unwrap_err();
    assert_eq!(core_error(err), detached);

    assert_eq!(manager.snapshot(child).await.unwrap(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn appends_racing_a_revert_keep_the_log_linear() {
    const APPENDS: usize = 32;

    let manager = std::sync::Arc::new(manager());
    let root = manager.create_root().await.unwrap();
    manager.append(root, NewEntry::user("task")).await.unwrap();
    let cp = manager.checkpoint(root).await.unwrap();

    let mut appends = Vec::new();
    for i in 0..APPENDS {
        let manager = std::sync::Arc::clone(&manager);
        appends.push(tokio::spawn(async move {
            manager.append(root, NewEntry::user(format!("step {i}"))).await
        }));
    }
    let reverter = {
        let manager = std::sync::Arc::clone(&manager);
        tokio::spawn(async move { manager.revert(root, cp.id, "fold").await })
    };

    let mut assigned = Vec::new();
    for handle in appends {
        assigned.push(handle.await.unwrap().unwrap());
    }
    let outcome = reverter.await.unwrap().unwrap();

    let entries = manager.entries_from(root, 0).await.unwrap();
    assert_eq!(entries[0].text(), Some("task"));
    assert_eq!(entries[1].checkpoint, Some(cp.id));
    assert_eq!(entries[2].sequence, outcome.fold_sequence);
    assert_eq!(entries[2].role, Role::Agent);
    assert_eq!(entries[2].text(), Some("fold"));

    let survivors = &entries[3..];
    assert!(survivors.iter().all(|e| e.role == Role::User));
    assert!(survivors.iter().all(|e| assigned.contains(&e.sequence)));
    assert!(entries.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(survivors.len() + outcome.discarded, APPENDS);

    assigned.push(outcome.fold_sequence);
    assigned.sort_unstable();
    assigned.dedup();
    assert_eq!(assigned.len(), APPENDS + 1);
}
