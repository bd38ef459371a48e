use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stampede_service::config::Config;
use stampede_service::locking::{
    DistributedLockProvider, FilesystemLockStore, LockError, LockProvider, LockStore,
    MemoryLockStore,
};
use stampede_service::{
    AsyncCollapserOptions, AsyncRequestCollapser, CancellationToken, CollapseError,
    CollapserOptions, Context, RequestCollapser,
};

use crate::{ExecutionCounter, Gate, PARALLELISM, RecordingLockProvider, test, wait_until};

const RETRY: Duration = Duration::from_millis(5);

fn provider(store: Arc<dyn LockStore>, timeout: Duration) -> DistributedLockProvider {
    DistributedLockProvider::new(store, timeout, RETRY).unwrap()
}

fn lock_records(dir: &std::path::Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter(|entry| {
            let name = entry.as_ref().unwrap().file_name();
            name.to_string_lossy().ends_with(".lock")
        })
        .count()
}

#[test]
fn test_collapse_over_filesystem_store() {
    test::setup();
    let dir = test::tempdir();
    let store = Arc::new(FilesystemLockStore::new(dir.path()).unwrap());
    let locks = Arc::new(RecordingLockProvider::new(provider(
        store,
        Duration::from_secs(5),
    )));
    let collapser = RequestCollapser::<usize, String>::new(
        CollapserOptions::default().with_lock_provider(locks.clone()),
    )
    .unwrap();
    let counter = ExecutionCounter::new();
    let gate = Gate::new();

    let outcomes: Vec<_> = thread::scope(|s| {
        let (collapser, counter, gate) = (&collapser, &counter, &gate);
        let callers: Vec<_> = (0..PARALLELISM)
            .map(|_| {
                s.spawn(move || {
                    collapser.execute(
                        |_, _| {
                            gate.wait();
                            Ok(counter.hit())
                        },
                        &Context::new("key"),
                        &CancellationToken::new(),
                    )
                })
            })
            .collect();

        wait_until(|| locks.releases() >= PARALLELISM);
        // every record is removed as soon as its holder joined
        assert_eq!(lock_records(dir.path()), 0);
        gate.open();

        callers
            .into_iter()
            .map(|caller| caller.join().unwrap())
            .collect()
    });

    assert_eq!(counter.count(), 1);
    assert_eq!(outcomes, vec![Ok(1); PARALLELISM]);
    assert_eq!(lock_records(dir.path()), 0);
}

#[test]
fn test_timeout_only_affects_waiting_caller() {
    test::setup();
    let store = Arc::new(MemoryLockStore::new());
    // another process holding the lock for the key
    let holder = provider(store.clone(), Duration::from_secs(5));
    let collapser = RequestCollapser::<usize, String>::new(
        CollapserOptions::default().with_lock_provider(Arc::new(provider(
            store.clone(),
            Duration::from_millis(50),
        ))),
    )
    .unwrap();
    let counter = ExecutionCounter::new();

    let mut held = LockProvider::acquire_lock(
        &holder,
        "key",
        &Context::new("key"),
        &CancellationToken::new(),
    )
    .unwrap();

    let outcome = collapser.execute(
        |_, _| Ok(counter.hit()),
        &Context::new("key"),
        &CancellationToken::new(),
    );
    let error = outcome.unwrap_err();
    assert!(error.is_cancellation());
    assert!(matches!(
        error,
        CollapseError::Lock(LockError::Timeout { ref key, .. }) if key == "key"
    ));
    assert_eq!(counter.count(), 0);

    // other keys are not affected
    let outcome = collapser.execute(
        |_, _| Ok(counter.hit()),
        &Context::new("other"),
        &CancellationToken::new(),
    );
    assert_eq!(outcome, Ok(1));

    held.release();
    assert_eq!(store.owner("key"), None);

    let outcome = collapser.execute(
        |_, _| Ok(counter.hit()),
        &Context::new("key"),
        &CancellationToken::new(),
    );
    assert_eq!(outcome, Ok(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_collapse_over_shared_store() {
    test::setup();
    let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
    let locks = Arc::new(RecordingLockProvider::new(provider(
        store,
        Duration::from_secs(5),
    )));
    let collapser = Arc::new(
        AsyncRequestCollapser::<usize, String>::new(
            AsyncCollapserOptions::default().with_lock_provider(locks.clone()),
        )
        .unwrap(),
    );
    let counter = Arc::new(ExecutionCounter::new());
    let gate = Arc::new(Gate::new());

    let callers: Vec<_> = (0..PARALLELISM)
        .map(|_| {
            let collapser = Arc::clone(&collapser);
            let counter = Arc::clone(&counter);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                collapser
                    .execute(
                        move |_, _| async move {
                            gate.wait_async().await;
                            Ok(counter.hit())
                        },
                        &Context::new("key"),
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    crate::wait_until_async(|| locks.releases() >= PARALLELISM).await;
    gate.open();

    for caller in futures::future::join_all(callers).await {
        assert_eq!(caller.unwrap(), Ok(1));
    }
    assert_eq!(counter.count(), 1);
}

#[test]
fn test_collapser_from_config() {
    test::setup();
    let dir = test::tempdir();
    let yaml = format!(
        r#"
        collapser:
          lock:
            type: distributed
            timeout: 1s
            retry_interval: 10ms
            lease: 30s
            backend:
              type: filesystem
              path: {}
        "#,
        dir.path().join("locks").display()
    );
    let config = Config::from_reader(yaml.as_bytes()).unwrap();
    let collapser =
        RequestCollapser::<usize, String>::new(config.collapser.options().unwrap()).unwrap();

    let outcome = collapser.execute(|_, _| Ok(3), &Context::new("key"), &CancellationToken::new());

    assert_eq!(outcome, Ok(3));
    assert!(dir.path().join("locks").is_dir());
    assert_eq!(lock_records(&dir.path().join("locks")), 0);
}
