// tests/lifecycle_scenarios.rs
//
// Сценарии одного прогона на MemoryProvider:
// - happy path: один снапшот, mount, notify, unmount, prune пустой;
// - mount failure: компенсирующий delete, число снапшотов не меняется;
// - retention sweep: отказ одного delete не мешает остальным;
// - notify failure: unmount и prune всё равно выполняются;
// - unmount failure: снапшот остаётся, исключается из prune до освобождения;
// - перекрытие прогонов: второй триггер во время Mounting -> Busy;
// - отмена во время Notifying: mount освобождается, prune откладывается;
// - снапшоты одной секунды: порядок по счётчику коллизий;
// - случайные отказы: после каждого прогона нет "осиротевших" mount.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use oorandom::Rand64;

use snapwarden::notify::{BackupNotifier, NotifyCall, NotifyError, RecordingNotifier};
use snapwarden::provider::memory::MountGate;
use snapwarden::provider::MemoryProvider;
use snapwarden::{
    CancelToken, LifecycleError, ManualClock, MountCoordinator, Orchestrator, Phase,
    RetentionPolicy, RunState, SnapshotHandle,
};

const NOW: u64 = 1_760_659_200;
const HOUR: u64 = 3600;
const DAY: u64 = 86_400;

struct Rig {
    clock: Arc<ManualClock>,
    provider: Arc<MemoryProvider>,
    notifier: Arc<RecordingNotifier>,
    orch: Orchestrator,
}

fn rig(policy: RetentionPolicy) -> Result<Rig> {
    let clock = Arc::new(ManualClock::new(NOW));
    let provider = Arc::new(MemoryProvider::new(clock.clone()));
    let notifier = Arc::new(RecordingNotifier::new());
    let mounts = MountCoordinator::new(provider.clone(), Path::new("/mnt")).with_clock(clock.clone());
    let orch = Orchestrator::new("/data", provider.clone(), mounts)
        .with_notifier(notifier.clone())
        .with_policy(policy)
        .with_clock(clock.clone());
    orch.reconcile()?;
    Ok(Rig {
        clock,
        provider,
        notifier,
        orch,
    })
}

fn snap_path(id: &str) -> PathBuf {
    PathBuf::from(format!("/mnt/snap-{}", id))
}

#[test]
fn happy_path_keeps_single_snapshot() -> Result<()> {
    let r = rig(RetentionPolicy::new(3, Some(Duration::from_secs(7 * DAY)), 1))?;
    let state = RunState::new();

    let rep = r.orch.run(&state)?;
    assert!(rep.succeeded());
    assert_eq!(rep.final_phase, Phase::Idle);

    let id = NOW.to_string();
    assert_eq!(rep.snapshot.as_ref().map(|h| h.id.as_str()), Some(id.as_str()));
    assert_eq!(rep.mount_path, Some(snap_path(&id)));
    assert_eq!(r.notifier.notified_paths(), vec![snap_path(&id)]);
    assert!(rep.notify_error.is_none());
    assert!(rep.pruned.is_empty());

    assert_eq!(r.provider.snapshot_ids(), vec![id]);
    assert!(r.provider.mounted_paths().is_empty());
    assert!(r.orch.mount_records().is_empty());

    assert!(!state.is_active());
    assert_eq!(state.last_outcome(), Some(Phase::Idle));
    Ok(())
}

#[test]
fn mount_failure_deletes_new_snapshot() -> Result<()> {
    let r = rig(RetentionPolicy::default())?;
    r.provider.seed_snapshot("OLD1", NOW - 2 * DAY, "/data");
    r.provider.seed_snapshot("OLD2", NOW - DAY, "/data");
    let before = r.provider.snapshot_ids();

    r.provider.fail_next_mounts(1);
    let state = RunState::new();
    let err = r.orch.run(&state).unwrap_err();
    assert!(matches!(err, LifecycleError::Provider { op: "mount", .. }), "{}", err);

    assert_eq!(r.provider.snapshot_ids(), before);
    assert_eq!(r.provider.calls().delete, 1);
    assert!(r.notifier.notified_paths().is_empty());
    assert!(r
        .notifier
        .calls()
        .iter()
        .any(|c| matches!(c, NotifyCall::Failed(_))));
    assert_eq!(state.last_outcome(), Some(Phase::Error));
    assert!(!state.is_active());
    Ok(())
}

#[test]
fn failed_compensation_is_left_to_retention() -> Result<()> {
    let r = rig(RetentionPolicy::new(1, None, 1))?;
    let state = RunState::new();

    r.provider.fail_next_mounts(1);
    r.provider.fail_delete_of(&NOW.to_string());
    assert!(r.orch.run(&state).is_err());
    assert_eq!(r.provider.snapshot_ids(), vec![NOW.to_string()]);

    r.provider.clear_failures();
    r.clock.advance(HOUR);
    let rep = r.orch.run(&state)?;
    assert!(rep.succeeded());
    assert_eq!(rep.pruned, vec![NOW.to_string()]);
    assert_eq!(r.provider.snapshot_ids(), vec![(NOW + HOUR).to_string()]);
    Ok(())
}

#[test]
fn retention_sweep_survives_one_delete_failure() -> Result<()> {
    let r = rig(RetentionPolicy::new(3, None, 1))?;
    // A самый старый
    for (i, id) in ["A", "B", "C", "D"].iter().enumerate() {
        r.provider.seed_snapshot(id, NOW - (4 - i as u64) * DAY, "/data");
    }
    r.provider.fail_delete_of("A");

    let state = RunState::new();
    let rep = r.orch.run(&state)?;
    assert!(rep.succeeded(), "{}", rep.summary());
    assert_eq!(rep.pruned, vec!["B".to_string()]);
    assert_eq!(rep.prune_failures.len(), 1);
    assert_eq!(rep.prune_failures[0].0, "A");

    let left: HashSet<String> = r.provider.snapshot_ids().into_iter().collect();
    let want: HashSet<String> = ["A", "C", "D"]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(NOW.to_string()))
        .collect();
    assert_eq!(left, want);
    Ok(())
}

#[test]
fn standalone_prune_of_five_removes_two_oldest() -> Result<()> {
    let r = rig(RetentionPolicy::new(3, None, 1))?;
    for (i, id) in ["S1", "S2", "S3", "S4", "S5"].iter().enumerate() {
        r.provider.seed_snapshot(id, NOW - (10 - i as u64) * HOUR, "/data");
    }
    r.provider.fail_delete_of("S1");

    let rep = r.orch.prune(&RunState::new(), false)?;
    let planned: Vec<&str> = rep.plan.prune.iter().rev().map(|h| h.id.as_str()).collect();
    assert_eq!(planned, vec!["S1", "S2"]);
    assert_eq!(rep.deleted, vec!["S2".to_string()]);
    assert_eq!(rep.failures.len(), 1);
    assert_eq!(r.provider.snapshot_ids(), vec!["S1", "S3", "S4", "S5"]);
    Ok(())
}

#[test]
fn notify_failure_still_unmounts_and_prunes() -> Result<()> {
    let r = rig(RetentionPolicy::new(2, None, 1))?;
    r.provider.seed_snapshot("OLD1", NOW - 3 * DAY, "/data");
    r.provider.seed_snapshot("OLD2", NOW - 2 * DAY, "/data");
    r.notifier.set_failing(true);

    let state = RunState::new();
    let rep = r.orch.run(&state)?;
    assert!(!rep.succeeded());
    assert_eq!(rep.final_phase, Phase::Error);
    assert!(rep.notify_error.is_some());

    assert!(r.provider.mounted_paths().is_empty());
    assert!(r.orch.mount_records().is_empty());
    assert_eq!(rep.pruned, vec!["OLD1".to_string()]);
    assert_eq!(state.last_outcome(), Some(Phase::Error));
    assert!(matches!(r.notifier.calls().last(), Some(NotifyCall::Failed(_))));
    Ok(())
}

/// SIGINT, пришедший пока агент получает снапшот.
struct CancellingNotifier {
    cancel: CancelToken,
}

impl BackupNotifier for CancellingNotifier {
    fn notify(&self, _snapshot: &SnapshotHandle, _mount_path: &Path) -> Result<(), NotifyError> {
        self.cancel.cancel();
        Ok(())
    }
}

#[test]
fn cancel_during_notify_releases_mount_and_skips_pruning() -> Result<()> {
    let r = rig(RetentionPolicy::new(1, None, 1))?;
    r.provider.seed_snapshot("OLD1", NOW - 2 * DAY, "/data");
    r.provider.seed_snapshot("OLD2", NOW - DAY, "/data");
    let cancel = r.orch.cancel_token().clone();
    let orch = r.orch.with_notifier(Arc::new(CancellingNotifier {
        cancel: cancel.clone(),
    }));

    let state = RunState::new();
    let rep = orch.run(&state)?;
    assert!(cancel.is_cancelled());
    assert!(rep.succeeded(), "{}", rep.summary());
    assert!(rep.prune_skipped);
    assert!(rep.pruned.is_empty());
    assert!(rep.summary().contains("prune=skipped"));

    assert_eq!(r.provider.calls().delete, 0);
    assert_eq!(r.provider.snapshot_ids().len(), 3);
    assert!(r.provider.mounted_paths().is_empty());
    assert!(orch.mount_records().is_empty());
    assert_eq!(state.last_outcome(), Some(Phase::Idle));
    assert!(!state.is_active());
    Ok(())
}

#[test]
fn same_second_snapshots_prune_by_collision_counter() -> Result<()> {
    let r = rig(RetentionPolicy::new(9, None, 1))?;
    r.provider.seed_snapshot(&NOW.to_string(), NOW, "/data");
    for n in 1..11 {
        r.provider.seed_snapshot(&format!("{NOW}-{n}"), NOW, "/data");
    }

    let rep = r.orch.run(&RunState::new())?;
    assert!(rep.succeeded(), "{}", rep.summary());
    let newest = format!("{NOW}-11");
    assert_eq!(rep.snapshot.as_ref().map(|h| h.id.as_str()), Some(newest.as_str()));
    assert_eq!(
        rep.pruned,
        vec![NOW.to_string(), format!("{NOW}-1"), format!("{NOW}-2")]
    );

    let left = r.provider.snapshot_ids();
    assert_eq!(left.len(), 9);
    assert!(left.contains(&format!("{NOW}-10")));
    assert!(left.contains(&newest));
    Ok(())
}

#[test]
fn unmount_failure_defers_and_protects_snapshot() -> Result<()> {
    let r = rig(RetentionPolicy::new(1, None, 1))?;
    let state = RunState::new();
    let first = NOW.to_string();
    let first_path = snap_path(&first);

    r.provider.fail_unmount_of(&first_path);
    let rep1 = r.orch.run(&state)?;
    assert!(rep1.succeeded());
    assert!(rep1.deferred_unmount);
    assert_eq!(r.provider.mounted_paths(), vec![first_path.clone()]);

    // второй прогон: первый снапшот уже вне политики, но всё ещё смонтирован
    r.clock.advance(HOUR);
    let rep2 = r.orch.run(&state)?;
    assert_eq!(rep2.lingering, vec![first.clone()]);
    assert!(rep2.pruned.is_empty());
    assert!(r.provider.snapshot_ids().contains(&first));

    // освободился: третий прогон отмонтирует и удалит
    r.provider.clear_failures();
    r.clock.advance(HOUR);
    let rep3 = r.orch.run(&state)?;
    assert!(rep3.lingering.is_empty());
    assert!(rep3.pruned.contains(&first));
    assert!(r.provider.mounted_paths().is_empty());
    assert_eq!(r.provider.snapshot_ids(), vec![(NOW + 2 * HOUR).to_string()]);
    Ok(())
}

#[test]
fn second_trigger_during_mounting_is_busy() -> Result<()> {
    let r = rig(RetentionPolicy::default())?;
    let gate = MountGate::new();
    r.provider.set_mount_gate(gate.clone());
    let state = RunState::new();

    let first = thread::scope(|s| {
        let h = s.spawn(|| r.orch.run(&state));
        gate.wait_entered();
        assert_eq!(state.phase(), Phase::Mounting);

        let second = r.orch.run(&state);
        assert!(matches!(second, Err(LifecycleError::Busy)));

        gate.open();
        h.join().expect("run thread panicked")
    })?;

    assert!(first.succeeded());
    assert_eq!(r.provider.calls().create, 1);
    assert_eq!(r.provider.snapshot_ids().len(), 1);
    assert!(!state.is_active());
    Ok(())
}

#[test]
fn randomized_failures_leave_no_orphaned_mounts() -> Result<()> {
    let r = rig(RetentionPolicy::new(3, None, 1))?;
    let state = RunState::new();
    let mut rng = Rand64::new(0x5A9_3A2D);

    for round in 0..40 {
        r.provider.clear_failures();
        r.notifier.set_failing(rng.rand_range(0..4) == 0);
        match rng.rand_range(0..6) {
            0 => r.provider.fail_next_mounts(1),
            1 => r.provider.fail_next_unmounts(2),
            2 => r.provider.fail_next_creates(1),
            _ => {}
        }
        if rng.rand_range(0..3) == 0 {
            if let Some(oldest) = r.provider.snapshot_ids().first() {
                r.provider.fail_delete_of(oldest);
            }
        }

        let _ = r.orch.run(&state);
        assert!(!state.is_active(), "round {}", round);

        let existing: HashSet<String> = r.provider.snapshot_ids().into_iter().collect();
        let records = r.orch.mount_records();
        for rec in &records {
            assert!(
                existing.contains(&rec.snapshot_id),
                "round {}: record for deleted snapshot {}",
                round,
                rec.snapshot_id
            );
        }
        let recorded: HashSet<PathBuf> = records.iter().map(|m| m.mount_path.clone()).collect();
        let live: HashSet<PathBuf> = r.provider.mounted_paths().into_iter().collect();
        assert_eq!(recorded, live, "round {}", round);

        r.clock.advance(HOUR);
    }
    Ok(())
}
