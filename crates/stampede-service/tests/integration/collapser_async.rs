use std::sync::{Arc, Mutex};
use std::time::Duration;

use stampede_service::collapser::Outcome;
use stampede_service::locking::{
    AsyncInstanceLockProvider, AsyncLockProvider, BlockingLockAdapter, InstanceLockProvider,
    StripedLockProvider,
};
use stampede_service::{
    AsyncCollapserOptions, AsyncRequestCollapser, CancellationToken, CollapseError,
    CollapserEvent, Context,
};

use crate::{
    ExecutionCounter, Gate, PARALLELISM, RecordingLockProvider, test, wait_until_async,
};

type Collapser = Arc<AsyncRequestCollapser<usize, String>>;
type Locks = Arc<RecordingLockProvider<StripedLockProvider>>;

fn recorded_collapser(
    options: AsyncCollapserOptions,
    locks: StripedLockProvider,
) -> (Collapser, Locks) {
    let locks = Arc::new(RecordingLockProvider::new(locks));
    let collapser =
        AsyncRequestCollapser::new(options.with_lock_provider(locks.clone())).unwrap();
    (Arc::new(collapser), locks)
}

/// Spawns `size` concurrent calls for `key`, all released at once after every one of them joined.
async fn run_batch<F>(
    collapser: &Collapser,
    locks: &Locks,
    size: usize,
    key: &'static str,
    work: F,
) -> Vec<Outcome<usize, String>>
where
    F: Fn() -> Result<usize, String> + Send + Sync + 'static,
{
    let gate = Arc::new(Gate::new());
    let work = Arc::new(work);
    let joined = locks.releases() + size;

    let callers: Vec<_> = (0..size)
        .map(|_| {
            let collapser = Arc::clone(collapser);
            let gate = Arc::clone(&gate);
            let work = Arc::clone(&work);
            tokio::spawn(async move {
                collapser
                    .execute(
                        move |_, _| async move {
                            gate.wait_async().await;
                            work()
                        },
                        &Context::new(key),
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    // nothing is evicted before the gate opens, so every release is a caller joining
    wait_until_async(|| locks.releases() >= joined).await;
    gate.open();

    futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|caller| caller.unwrap())
        .collect()
}

#[tokio::test]
async fn test_parallel_calls_collapse() {
    test::setup();
    let (collapser, locks) =
        recorded_collapser(AsyncCollapserOptions::default(), StripedLockProvider::default());
    let counter = Arc::new(ExecutionCounter::new());

    let outcomes = {
        let counter = Arc::clone(&counter);
        run_batch(&collapser, &locks, PARALLELISM, "key", move || {
            Ok(counter.hit())
        })
        .await
    };

    assert_eq!(counter.count(), 1);
    assert_eq!(outcomes, vec![Ok(1); PARALLELISM]);
}

#[tokio::test]
async fn test_calls_without_key_run_separately() {
    test::setup();
    let events = Arc::new(Mutex::new(Vec::new()));
    let options = {
        let events = Arc::clone(&events);
        AsyncCollapserOptions::default().with_listener(
            move |event: CollapserEvent, _: &Context| {
                events.lock().unwrap().push(event);
            },
        )
    };
    let (collapser, locks) = recorded_collapser(options, StripedLockProvider::default());
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
                            let execution = counter.hit();
                            gate.wait_async().await;
                            Ok(execution)
                        },
                        &Context::anonymous(),
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    // all of them are running at the same time
    gate.wait_for_waiters_async(PARALLELISM).await;
    gate.open();
    let mut results: Vec<usize> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|caller| caller.unwrap().unwrap())
        .collect();

    // every caller got the result of its own execution
    results.sort();
    assert_eq!(results, (1..=PARALLELISM).collect::<Vec<_>>());
    assert_eq!(counter.count(), PARALLELISM);
    assert_eq!(locks.acquisitions(), 0);
    assert_eq!(
        *events.lock().unwrap(),
        vec![CollapserEvent::NoKey; PARALLELISM]
    );
}

#[tokio::test]
async fn test_distinct_keys_run_concurrently() {
    test::setup();
    // a single stripe makes every key share the same lock
    let (collapser, _locks) = recorded_collapser(
        AsyncCollapserOptions::default(),
        StripedLockProvider::new(1).unwrap(),
    );
    let counter = Arc::new(ExecutionCounter::new());
    let gate = Arc::new(Gate::new());

    let callers: Vec<_> = (0..PARALLELISM)
        .map(|i| {
            let collapser = Arc::clone(&collapser);
            let counter = Arc::clone(&counter);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                collapser
                    .execute(
                        move |_, _| async move {
                            counter.hit();
                            gate.wait_async().await;
                            Ok(i)
                        },
                        &Context::new(format!("key-{i}")),
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    // the lock is not held while the work runs
    gate.wait_for_waiters_async(PARALLELISM).await;
    gate.open();

    let outcomes: Vec<_> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|caller| caller.unwrap())
        .collect();
    let expected: Vec<Outcome<usize, String>> = (0..PARALLELISM).map(Ok).collect();

    assert_eq!(counter.count(), PARALLELISM);
    assert_eq!(outcomes, expected);
}

#[tokio::test]
async fn test_sequential_calls_execute_each_time() {
    test::setup();
    let collapser =
        AsyncRequestCollapser::<usize, String>::new(AsyncCollapserOptions::default()).unwrap();
    let counter = Arc::new(ExecutionCounter::new());

    for expected in 1..=3 {
        let counter = Arc::clone(&counter);
        let outcome = collapser
            .execute(
                move |_, _| async move { Ok(counter.hit()) },
                &Context::new("key"),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, Ok(expected));
    }
    assert_eq!(counter.count(), 3);
}

#[tokio::test]
async fn test_custom_key_strategy() {
    test::setup();
    let options = AsyncCollapserOptions::default().with_key_strategy(
        |context: &Context| -> Option<String> { context.property("tenant").map(str::to_owned) },
    );
    let (collapser, locks) = recorded_collapser(options, StripedLockProvider::default());
    let counter = Arc::new(ExecutionCounter::new());
    let gate = Arc::new(Gate::new());

    // different operations of the same tenant collapse
    let callers: Vec<_> = (0..PARALLELISM)
        .map(|i| {
            let collapser = Arc::clone(&collapser);
            let counter = Arc::clone(&counter);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let context =
                    Context::new(format!("operation-{i}")).with_property("tenant", "acme");
                collapser
                    .execute(
                        move |_, _| async move {
                            gate.wait_async().await;
                            Ok(counter.hit())
                        },
                        &context,
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    wait_until_async(|| locks.releases() >= PARALLELISM).await;
    gate.open();

    for caller in futures::future::join_all(callers).await {
        assert_eq!(caller.unwrap(), Ok(1));
    }
    assert_eq!(counter.count(), 1);
}

#[tokio::test]
async fn test_callback_receives_creator_context() {
    test::setup();
    let collapser =
        AsyncRequestCollapser::<String, String>::new(AsyncCollapserOptions::default()).unwrap();
    let context = Context::new("key").with_property("region", "eu");

    let outcome = collapser
        .execute(
            |context, cancel| async move {
                assert!(!cancel.is_cancelled());
                context
                    .property("region")
                    .map(str::to_owned)
                    .ok_or_else(|| "no region".to_owned())
            },
            &context,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome, Ok("eu".to_owned()));
}

#[tokio::test]
async fn test_failure_is_shared_within_a_batch_only() {
    test::setup();
    let (collapser, locks) =
        recorded_collapser(AsyncCollapserOptions::default(), StripedLockProvider::default());
    let counter = Arc::new(ExecutionCounter::new());
    let work = {
        let counter = Arc::clone(&counter);
        move || {
            counter.hit();
            Err(format!("failure-{}", rand::random::<u64>()))
        }
    };

    let first = run_batch(&collapser, &locks, PARALLELISM, "key", work.clone()).await;
    let second = run_batch(&collapser, &locks, PARALLELISM, "key", work).await;

    assert_eq!(counter.count(), 2);
    for batch in [&first, &second] {
        assert!(matches!(batch[0], Err(CollapseError::Failed(_))));
        assert!(batch.iter().all(|outcome| *outcome == batch[0]));
    }
    assert_ne!(first[0], second[0]);
}

#[tokio::test]
async fn test_lock_acquired_twice_per_call() {
    test::setup();
    let (collapser, locks) =
        recorded_collapser(AsyncCollapserOptions::default(), StripedLockProvider::default());

    let outcome = collapser
        .execute(
            |_, _| async { Ok(1) },
            &Context::new("key"),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome, Ok(1));
    // once to join, once to evict
    assert_eq!(locks.acquisitions(), 2);
    assert_eq!(locks.releases(), 2);
}

#[tokio::test]
async fn test_lock_acquisitions_for_a_batch() {
    test::setup();
    let (collapser, locks) =
        recorded_collapser(AsyncCollapserOptions::default(), StripedLockProvider::default());
    let counter = Arc::new(ExecutionCounter::new());

    let outcomes = {
        let counter = Arc::clone(&counter);
        run_batch(&collapser, &locks, PARALLELISM, "key", move || {
            Ok(counter.hit())
        })
        .await
    };
    assert_eq!(outcomes, vec![Ok(1); PARALLELISM]);

    // every caller locks once to join; callers still finding the execution registered lock
    // again to evict it, and at least the first one does
    let acquisitions = locks.acquisitions();
    assert!(
        (PARALLELISM + 1..=2 * PARALLELISM).contains(&acquisitions),
        "{acquisitions} acquisitions"
    );
    assert_eq!(locks.releases(), acquisitions);

    // the batch was evicted, so the next call executes again
    let outcome = {
        let counter = Arc::clone(&counter);
        collapser
            .execute(
                move |_, _| async move { Ok(counter.hit()) },
                &Context::new("key"),
                &CancellationToken::new(),
            )
            .await
    };
    assert_eq!(outcome, Ok(2));
    assert_eq!(locks.acquisitions(), acquisitions + 2);
}

#[tokio::test]
async fn test_panic_is_shared() {
    test::setup();
    let (collapser, locks) =
        recorded_collapser(AsyncCollapserOptions::default(), StripedLockProvider::default());
    let counter = Arc::new(ExecutionCounter::new());

    let outcomes = {
        let counter = Arc::clone(&counter);
        run_batch(&collapser, &locks, PARALLELISM, "key", move || {
            counter.hit();
            panic!("upstream exploded");
        })
        .await
    };

    assert_eq!(counter.count(), 1);
    assert_eq!(
        outcomes,
        vec![Err(CollapseError::Panicked("upstream exploded".to_owned())); PARALLELISM]
    );
}

#[tokio::test]
async fn test_cancelled_while_waiting_for_lock() {
    test::setup();
    let locks = Arc::new(AsyncInstanceLockProvider::new());
    let collapser = Arc::new(
        AsyncRequestCollapser::<usize, String>::new(
            AsyncCollapserOptions::default().with_lock_provider(locks.clone()),
        )
        .unwrap(),
    );
    let counter = Arc::new(ExecutionCounter::new());
    let cancel = CancellationToken::new();

    // the instance lock is shared by all keys
    let other = Context::new("other");
    let uncancelled = CancellationToken::new();
    let mut held = locks
        .acquire_lock("other", &other, &uncancelled)
        .await
        .unwrap();

    let caller = {
        let collapser = Arc::clone(&collapser);
        let counter = Arc::clone(&counter);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            collapser
                .execute(
                    move |_, _| async move { Ok(counter.hit()) },
                    &Context::new("key"),
                    &cancel,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let error = caller.await.unwrap().unwrap_err();
    held.release().await;

    assert!(error.is_cancellation(), "{error:?}");
    assert_eq!(counter.count(), 0);
}

#[tokio::test]
async fn test_blocking_provider_adapter() {
    test::setup();
    let options = AsyncCollapserOptions::default()
        .with_lock_provider(Arc::new(BlockingLockAdapter::new(InstanceLockProvider::new())));
    let collapser = AsyncRequestCollapser::<usize, String>::new(options).unwrap();

    let outcome = collapser
        .execute(
            |_, _| async { Err("unavailable".to_owned()) },
            &Context::new("key"),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome, Err(CollapseError::Failed("unavailable".to_owned())));
}
