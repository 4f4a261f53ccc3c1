
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use miner_lite::executor::{
    ExecutorClass, ExecutorId, ExecutorState, ExecutorToken, ExitOutcome, Manifest,
    OrphanExecutor, RuntimeRef, WaitOutcome,
};
use miner_lite::ports::LeaseOwner;
use miner_lite::MinerError;
use test_harness::{assert_eventually, test_supervisor, FakeBackend};

const LONG: Duration = Duration::from_secs(60);

fn cpu_basic() -> ExecutorClass {
    ExecutorClass::new("cpu-basic")
}

fn token() -> ExecutorToken {
    ExecutorToken::generate()
}

#[tokio::test]
async fn test_concurrent_starts_get_distinct_ports_then_backpressure() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 10));
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9002);

    let (a, b, c) = tokio::join!(
        supervisor.start(token(), cpu_basic(), LONG),
        supervisor.start(token(), cpu_basic(), LONG),
        supervisor.start(token(), cpu_basic(), LONG),
    );
    let handles = vec![a.unwrap(), b.unwrap(), c.unwrap()];

    let mut used: Vec<u16> = handles.iter().map(|h| h.port).collect();
    used.sort();
    assert_eq!(used, vec![9000, 9001, 9002]);

    let err = supervisor
        .start(token(), cpu_basic(), LONG)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MinerError::PortsExhausted {
            start: 9000,
            end: 9002
        }
    ));
    assert!(err.is_backpressure());

    let freed = handles[1].port;
    backend.exit(handles[1].id, 0);
    let outcome = supervisor.wait(&handles[1], Duration::from_secs(2)).await;
    assert_eq!(outcome, WaitOutcome::exited(ExitOutcome::Completed { code: 0 }));
    assert!(!ports.is_leased(freed));

    let fourth = supervisor
        .start(token(), cpu_basic(), LONG)
        .await
        .unwrap();
    assert_eq!(fourth.port, freed);
}

#[tokio::test]
async fn test_manifest_tracks_active_handles() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    assert_eq!(supervisor.manifest().await.count(&cpu_basic()), 5);

    let first = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    let second = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    assert_eq!(supervisor.manifest().await.count(&cpu_basic()), 3);

    backend.exit(first.id, 0);
    backend.exit(second.id, 1);
    supervisor.wait(&first, Duration::from_secs(2)).await;
    supervisor.wait(&second, Duration::from_secs(2)).await;

    assert_eq!(supervisor.manifest().await.count(&cpu_basic()), 5);
    assert_eq!(
        second.state(),
        ExecutorState::Failed {
            outcome: ExitOutcome::Completed { code: 1 }
        }
    );
}

#[tokio::test]
async fn test_manifest_never_negative_or_above_declared() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 2));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    let err = supervisor
        .start(token(), cpu_basic(), LONG)
        .await
        .unwrap_err();
    assert!(matches!(err, MinerError::CapacityExhausted { .. }));

    // Backend lowers its promise below what is already running
    backend.set_manifest(Manifest::new().with_class("cpu-basic", 1));
    assert_eq!(supervisor.manifest().await.count(&cpu_basic()), 0);
}

#[tokio::test]
async fn test_kill_on_exited_handle_is_noop() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    let handle = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    backend.exit(handle.id, 0);
    let outcome = supervisor.wait(&handle, Duration::from_secs(2)).await;
    assert!(outcome.outcome().is_some());

    let before = supervisor.manifest().await;
    supervisor.kill(&handle).await.unwrap();
    assert_eq!(supervisor.manifest().await, before);
    assert_eq!(backend.kills.load(Ordering::SeqCst), 0);
    assert_eq!(
        handle.state(),
        ExecutorState::Exited {
            outcome: ExitOutcome::Completed { code: 0 }
        }
    );
}

#[tokio::test]
async fn test_killing_twice_equals_killing_once() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9099);

    let handle = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    supervisor.kill(&handle).await.unwrap();
    supervisor.kill(&handle).await.unwrap();

    assert_eq!(
        handle.state(),
        ExecutorState::Exited {
            outcome: ExitOutcome::Killed
        }
    );
    assert_eq!(ports.leased(), 0);
    assert_eq!(supervisor.active().await, 0);
    assert_eq!(supervisor.manifest().await.count(&cpu_basic()), 5);
}

#[tokio::test]
async fn test_concurrent_kills_release_port_once() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9000);

    let handle = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    let (a, b) = tokio::join!(supervisor.kill(&handle), supervisor.kill(&handle));
    a.unwrap();
    b.unwrap();

    assert_eq!(ports.leased(), 0);

    let released = || {
        backend
            .released()
            .iter()
            .filter(|id| **id == handle.id)
            .count()
    };
    assert_eventually(
        || async { released() == 1 },
        Duration::from_secs(2),
        "Backend should release the executor",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(released(), 1);
}

#[tokio::test]
async fn test_wait_returns_still_running_within_bound() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    let handle = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();

    let started = Instant::now();
    let outcome = supervisor.wait(&handle, Duration::from_millis(200)).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome, WaitOutcome::StillRunning);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(700), "wait took {:?}", elapsed);
    assert_eq!(handle.state(), ExecutorState::Running);
}

#[tokio::test]
async fn test_wait_is_bounded_when_backend_hangs() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    let handle = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    backend.hang_waits.store(true, Ordering::SeqCst);

    let started = Instant::now();
    let outcome = supervisor.wait(&handle, Duration::from_millis(100)).await;

    assert_eq!(outcome, WaitOutcome::StillRunning);
    assert!(started.elapsed() < Duration::from_millis(600));
}

#[tokio::test]
async fn test_start_failure_releases_port() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    backend.fail_starts.store(true, Ordering::SeqCst);
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9002);

    let err = supervisor
        .start(token(), cpu_basic(), LONG)
        .await
        .unwrap_err();

    assert!(matches!(err, MinerError::Provisioning(_)));
    assert!(err.is_retryable());
    assert_eq!(ports.leased(), 0);
    assert_eq!(supervisor.active().await, 0);
    assert_eq!(supervisor.manifest().await.count(&cpu_basic()), 5);
}

#[tokio::test]
async fn test_kill_racing_wait_observes_killed() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    let handle = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();

    let waiter = {
        let supervisor = supervisor.clone();
        let handle = handle.clone();
        tokio::spawn(async move { supervisor.wait(&handle, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    supervisor.kill(&handle).await.unwrap();

    let outcome = waiter.await.unwrap();
    assert_eq!(outcome, WaitOutcome::exited(ExitOutcome::Killed));
}

#[tokio::test]
async fn test_termination_failure_marks_failed_and_releases_port() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9099);

    let handle = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    backend.stubborn.store(true, Ordering::SeqCst);

    let err = supervisor.kill(&handle).await.unwrap_err();
    assert!(matches!(err, MinerError::Termination { .. }));
    assert_eq!(
        handle.state(),
        ExecutorState::Failed {
            outcome: ExitOutcome::TerminationFailed
        }
    );
    assert!(!ports.is_leased(handle.port));
    assert_eq!(supervisor.active().await, 0);
}

#[tokio::test]
async fn test_deadline_terminates_executor() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9099);

    let handle = supervisor
        .start(token(), cpu_basic(), Duration::from_millis(150))
        .await
        .unwrap();

    assert_eventually(
        || async { handle.state().is_terminal() },
        Duration::from_secs(3),
        "Executor should be terminated at its deadline",
    )
    .await;

    assert_eq!(
        handle.state(),
        ExecutorState::Exited {
            outcome: ExitOutcome::TimedOut
        }
    );
    assert!(backend.kills.load(Ordering::SeqCst) >= 1);
    assert_eq!(ports.leased(), 0);
}

#[tokio::test]
async fn test_exit_is_observed_without_any_waiter() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9099);

    let handle = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    backend.exit(handle.id, 3);

    assert_eventually(
        || async { handle.state().is_terminal() },
        Duration::from_secs(3),
        "Exited executor should be deregistered",
    )
    .await;

    assert_eq!(
        handle.state(),
        ExecutorState::Failed {
            outcome: ExitOutcome::Completed { code: 3 }
        }
    );
    assert_eq!(ports.leased(), 0);
    assert_eq!(supervisor.manifest().await.count(&cpu_basic()), 5);
}

#[tokio::test]
async fn test_reaper_stops_on_cancel() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    assert_eq!(supervisor.reap_once().await, 0);

    let cancel = tokio_util::sync::CancellationToken::new();
    let reaper = {
        let supervisor = supervisor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { supervisor.run_reaper(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(120)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(1), reaper)
        .await
        .expect("reaper should stop after cancel")
        .unwrap();
}

#[tokio::test]
async fn test_reconcile_reclaims_and_quarantines() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    backend.add_orphan(
        OrphanExecutor {
            runtime: RuntimeRef::Container {
                name: "miner-executor-a".to_string(),
            },
            executor_id: Some(ExecutorId::new()),
            executor_class: Some(cpu_basic()),
            port: Some(9001),
        },
        true,
    );
    backend.add_orphan(
        OrphanExecutor {
            runtime: RuntimeRef::Container {
                name: "miner-executor-b".to_string(),
            },
            executor_id: None,
            executor_class: None,
            port: Some(9002),
        },
        false,
    );
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9002);

    let report = supervisor.reconcile().await;
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.quarantined_ports, vec![9002]);
    assert_eq!(ports.owner(9002), Some(LeaseOwner::Orphan));

    let first = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    let second = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    assert_ne!(first.port, 9002);
    assert_ne!(second.port, 9002);
    let err = supervisor
        .start(token(), cpu_basic(), LONG)
        .await
        .unwrap_err();
    assert!(matches!(err, MinerError::PortsExhausted { .. }));
}

#[tokio::test]
async fn test_token_reuse_is_rejected_while_live() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    let shared = ExecutorToken::new("job-42");
    let handle = supervisor
        .start(shared.clone(), cpu_basic(), LONG)
        .await
        .unwrap();

    let err = supervisor
        .start(shared.clone(), cpu_basic(), LONG)
        .await
        .unwrap_err();
    assert!(matches!(err, MinerError::TokenInUse));

    supervisor.kill(&handle).await.unwrap();
    supervisor.start(shared, cpu_basic(), LONG).await.unwrap();
}

#[tokio::test]
async fn test_unknown_class_is_rejected() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9099);

    let err = supervisor
        .start(token(), ExecutorClass::new("gpu-h100"), LONG)
        .await
        .unwrap_err();

    assert!(matches!(err, MinerError::Provisioning(_)));
    assert_eq!(ports.leased(), 0);
    assert_eq!(backend.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_backend_reports_zero_capacity() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9099);
    assert_eq!(supervisor.manifest().await.count(&cpu_basic()), 5);

    backend.hang_manifest.store(true, Ordering::SeqCst);

    let started = Instant::now();
    let manifest = supervisor.manifest().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(manifest, Manifest::new().with_class("cpu-basic", 0));

    let err = supervisor
        .start(token(), cpu_basic(), LONG)
        .await
        .unwrap_err();
    assert!(err.is_backpressure());
    assert_eq!(ports.leased(), 0);

    backend.hang_manifest.store(false, Ordering::SeqCst);
    assert_eq!(supervisor.manifest().await.count(&cpu_basic()), 5);
}

#[tokio::test]
async fn test_zero_declared_capacity_is_backpressure() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    backend.set_manifest(Manifest::new().with_class("cpu-basic", 0));

    assert_eq!(supervisor.manifest().await.count(&cpu_basic()), 0);
    let err = supervisor
        .start(token(), cpu_basic(), LONG)
        .await
        .unwrap_err();
    assert!(err.is_backpressure());
}

#[tokio::test]
async fn test_address_resolves_after_retries() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    let handle = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    backend.address_misses.store(3, Ordering::SeqCst);

    let err = supervisor.executor_address(handle.id).await.unwrap_err();
    assert!(matches!(err, MinerError::AddressUnavailable(_)));

    let addr = supervisor
        .await_address(handle.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(addr.port(), handle.port);

    let unknown = ExecutorId::new();
    let err = supervisor.executor_address(unknown).await.unwrap_err();
    assert!(matches!(err, MinerError::UnknownExecutor(id) if id == unknown));
}

#[tokio::test]
async fn test_await_address_gives_up_at_timeout() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    let handle = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    backend.address_misses.store(u32::MAX, Ordering::SeqCst);

    let started = Instant::now();
    let err = supervisor
        .await_address(handle.id, Duration::from_millis(300))
        .await
        .unwrap_err();

    assert!(matches!(err, MinerError::AddressUnavailable(_)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_shutdown_kills_all_and_refuses_starts() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9099);

    let first = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    let second = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();

    supervisor.shutdown().await;

    for handle in [&first, &second] {
        assert_eq!(
            handle.state(),
            ExecutorState::Exited {
                outcome: ExitOutcome::Killed
            }
        );
    }
    assert_eq!(ports.leased(), 0);

    let err = supervisor
        .start(token(), cpu_basic(), LONG)
        .await
        .unwrap_err();
    assert!(matches!(err, MinerError::Provisioning(_)));
}

#[tokio::test]
async fn test_many_concurrent_starts_never_share_a_port() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 100));
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9009);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..20 {
        let supervisor = supervisor.clone();
        tasks.spawn(async move { supervisor.start(token(), cpu_basic(), LONG).await });
    }

    let mut granted = HashSet::new();
    let mut exhausted = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(handle) => assert!(granted.insert(handle.port), "port {} leased twice", handle.port),
            Err(MinerError::PortsExhausted { .. }) => exhausted += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(granted.len(), 10);
    assert_eq!(exhausted, 10);
    assert_eq!(ports.leased(), 10);
}

#[tokio::test]
async fn test_executors_snapshot_lists_live_handles() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, _ports) = test_supervisor(backend.clone(), 9000, 9099);

    let first = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();
    let second = supervisor.start(token(), cpu_basic(), LONG).await.unwrap();

    let ids: HashSet<ExecutorId> = supervisor.executors().await.iter().map(|h| h.id).collect();
    assert_eq!(ids, HashSet::from([first.id, second.id]));
    assert_eq!(supervisor.get(first.id).await.map(|h| h.port), Some(first.port));

    supervisor.kill(&first).await.unwrap();
    assert!(supervisor.get(first.id).await.is_none());
    assert_eq!(supervisor.executors().await.len(), 1);
}

#[tokio::test]
async fn test_unbounded_timeouts_do_not_overflow() {
    let backend = FakeBackend::new(Manifest::new().with_class("cpu-basic", 5));
    let (supervisor, ports) = test_supervisor(backend.clone(), 9000, 9099);

    let handle = supervisor
        .start(token(), cpu_basic(), Duration::MAX)
        .await
        .unwrap();
    assert_eq!(handle.state(), ExecutorState::Running);
    assert_eq!(ports.leased(), 1);
    assert_eq!(supervisor.reap_once().await, 0);

    let waiter = {
        let supervisor = supervisor.clone();
        let handle = handle.clone();
        tokio::spawn(async move { supervisor.wait(&handle, Duration::MAX).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    backend.exit(handle.id, 0);

    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("wait should return once the executor exits")
        .unwrap();
    assert_eq!(outcome, WaitOutcome::exited(ExitOutcome::Completed { code: 0 }));
    assert_eq!(ports.leased(), 0);
    assert_eq!(supervisor.active().await, 0);
}
