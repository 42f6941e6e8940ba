use chrono::Duration;

use deespec_store::models::LockType;
use deespec_store::repo::sqlite::{self, SqliteLockRepository};
use deespec_store::LockRepository;

#[tokio::test]
async fn run_lock_excludes_a_second_holder() {
    let pool = sqlite::open_in_memory().await.unwrap();
    let repo = SqliteLockRepository::new(pool);

    let first = repo
        .try_acquire("run", None, 100, "host-a", Duration::seconds(30))
        .await
        .unwrap();
    let second = repo
        .try_acquire("run", None, 200, "host-b", Duration::seconds(30))
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
}

#[tokio::test]
async fn expired_lock_can_be_reacquired() {
    let pool = sqlite::open_in_memory().await.unwrap();
    let repo = SqliteLockRepository::new(pool);

    repo.try_acquire("run", None, 100, "host-a", Duration::milliseconds(-1))
        .await
        .unwrap();

    let reacquired = repo
        .try_acquire("run", None, 200, "host-b", Duration::seconds(30))
        .await
        .unwrap();

    assert!(reacquired);
    let record = repo.get("run").await.unwrap().unwrap();
    assert_eq!(record.pid, 200);
}

#[tokio::test]
async fn heartbeat_extends_expiry_only_for_holder() {
    let pool = sqlite::open_in_memory().await.unwrap();
    let repo = SqliteLockRepository::new(pool);

    repo.try_acquire(
        "sbi/SBI-1",
        Some(LockType::Write),
        100,
        "host-a",
        Duration::seconds(30),
    )
    .await
    .unwrap();

    let wrong_holder = repo.heartbeat("sbi/SBI-1", 999, Duration::seconds(30)).await.unwrap();
    assert!(!wrong_holder);

    let right_holder = repo.heartbeat("sbi/SBI-1", 100, Duration::seconds(60)).await.unwrap();
    assert!(right_holder);
}

#[tokio::test]
async fn release_requires_matching_pid() {
    let pool = sqlite::open_in_memory().await.unwrap();
    let repo = SqliteLockRepository::new(pool);

    repo.try_acquire("run", None, 100, "host-a", Duration::seconds(30))
        .await
        .unwrap();

    assert!(!repo.release("run", 999).await.unwrap());
    assert!(repo.release("run", 100).await.unwrap());
    assert!(repo.get("run").await.unwrap().is_none());
}
