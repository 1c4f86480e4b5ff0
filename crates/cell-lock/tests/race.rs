use std::sync::Arc;

use cell_lock::{AcquireOutcome, CellLockManager, LockChange, LockConfig, LockOwner};
use tokio::sync::Barrier;
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_acquires_grant_exactly_one() {
    for round in 0..50 {
        let locks = Arc::new(CellLockManager::new(LockConfig::default()));
        let contenders = 16;
        let barrier = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                let owner = if i % 2 == 0 {
                    LockOwner::human(format!("u{i}"))
                } else {
                    LockOwner::agent(format!("a{i}"))
                };
                tokio::spawn(async move {
                    barrier.wait().await;
                    (owner.clone(), locks.try_acquire("cellA", &owner))
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let winners: Vec<_> = results.iter().filter(|(_, o)| o.is_granted()).collect();
        assert_eq!(winners.len(), 1, "round {round}: {results:?}");
        let winner = winners[0].0.clone();
        for (owner, outcome) in &results {
            if *owner != winner {
                assert_eq!(
                    outcome,
                    &AcquireOutcome::Denied {
                        owner: winner.clone()
                    }
                );
            }
        }
        assert_eq!(locks.lock("cellA").unwrap().owner, winner);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn human_and_agent_race_one_wins() {
    let locks = Arc::new(CellLockManager::new(LockConfig::default()));
    let u1 = LockOwner::human("u1");
    let a1 = LockOwner::agent("a1");

    let (human, agent) = tokio::join!(
        {
            let locks = Arc::clone(&locks);
            let u1 = u1.clone();
            async move { locks.try_acquire("cellA", &u1) }
        },
        {
            let locks = Arc::clone(&locks);
            let a1 = a1.clone();
            async move { locks.try_acquire("cellA", &a1) }
        }
    );
    assert!(human.is_granted() ^ agent.is_granted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_cells_do_not_interfere() {
    let locks = Arc::new(CellLockManager::new(LockConfig::default()));
    let handles: Vec<_> = (0..64)
        .map(|i| {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let owner = LockOwner::human(format!("u{i}"));
                locks.try_acquire(&format!("cell{i}"), &owner)
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), AcquireOutcome::Granted);
    }
    assert_eq!(locks.len(), 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_duplicate_releases_are_harmless() {
    let locks = Arc::new(CellLockManager::new(LockConfig::default()));
    let u1 = LockOwner::human("u1");
    let u2 = LockOwner::human("u2");

    assert!(locks.try_acquire("c", &u1).is_granted());
    assert!(locks.release("c", &u1));
    assert!(locks.try_acquire("c", &u2).is_granted());

    // u1's duplicate release arrives after u2 took the cell.
    assert!(!locks.release("c", &u1));
    assert_eq!(locks.lock("c").unwrap().owner, u2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn last_published_change_matches_the_table() {
    for round in 0..50 {
        let locks = Arc::new(CellLockManager::new(LockConfig::default()));
        let mut changes = locks.subscribe();
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                let owner = LockOwner::human(format!("u{i}"));
                tokio::spawn(async move {
                    barrier.wait().await;
                    for _ in 0..10 {
                        if locks.try_acquire("cellA", &owner).is_granted() {
                            locks.release("cellA", &owner);
                        }
                    }
                    // Odd contenders try to keep the cell at the end.
                    if i % 2 == 1 {
                        locks.try_acquire("cellA", &owner);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut last: Option<LockChange> = None;
        loop {
            match changes.try_recv() {
                Ok(change) => last = Some(change),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        let last = last.expect("at least one change");
        let holder = locks.lock("cellA").map(|lock| lock.owner);
        assert_eq!(last.owner, holder, "round {round}");
    }
}
