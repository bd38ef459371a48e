use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, ensure};
use serde::Deserialize;
use stampede_service::config::CollapserConfig;
use stampede_service::{
    AsyncRequestCollapser, CancellationToken, CollapseError, Context, RequestCollapser,
};

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

fn default_keys() -> usize {
    1
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    /// The number of callers running at the same time.
    pub concurrency: usize,
    /// The number of distinct keys the callers pick from at random.
    #[serde(default = "default_keys")]
    pub keys: usize,
    /// How long a single execution takes.
    #[serde(with = "humantime_serde")]
    pub work: Duration,
    /// The probability of an execution failing.
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default)]
    pub engine: Engine,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Async,
    Blocking,
}

/// The value every simulated execution produces.
type Answer = usize;

enum Collapser {
    Async(AsyncRequestCollapser<Answer, String>),
    Blocking(Arc<RequestCollapser<Answer, String>>),
}

/// Counts what happened to the calls of a workload.
#[derive(Debug, Default)]
pub struct Stats {
    pub executions: AtomicUsize,
    pub failures: AtomicUsize,
    pub cancellations: AtomicUsize,
}

pub struct PreparedWorkload {
    collapser: Collapser,
    keys: usize,
    work: Duration,
    failure_rate: f64,
    pub stats: Arc<Stats>,
}

pub fn prepare_workload(config: &CollapserConfig, workload: Workload) -> Result<PreparedWorkload> {
    ensure!(workload.concurrency > 0, "concurrency must be positive");
    ensure!(workload.keys > 0, "a workload needs at least one key");
    ensure!(
        (0.0..=1.0).contains(&workload.failure_rate),
        "failure rate must be between 0 and 1"
    );

    let collapser = match workload.engine {
        Engine::Async => Collapser::Async(AsyncRequestCollapser::new(config.async_options()?)?),
        Engine::Blocking => {
            Collapser::Blocking(Arc::new(RequestCollapser::new(config.options()?)?))
        }
    };

    Ok(PreparedWorkload {
        collapser,
        keys: workload.keys,
        work: workload.work,
        failure_rate: workload.failure_rate,
        stats: Arc::new(Stats::default()),
    })
}

/// Finishes one simulated execution, failing at random.
fn outcome(stats: &Stats, failure_rate: f64) -> Result<Answer, String> {
    let execution = stats.executions.fetch_add(1, Ordering::Relaxed);
    if rand::random_bool(failure_rate) {
        Err(format!("simulated failure in execution {execution}"))
    } else {
        Ok(execution)
    }
}

pub async fn process_workload(workload: &Arc<PreparedWorkload>) {
    let key = rand::random_range(0..workload.keys);
    let context = Context::new(format!("key-{key}"));
    let (work, failure_rate) = (workload.work, workload.failure_rate);

    let result = match &workload.collapser {
        Collapser::Async(collapser) => {
            let stats = Arc::clone(&workload.stats);
            collapser
                .execute(
                    move |_, _| async move {
                        tokio::time::sleep(work).await;
                        outcome(&stats, failure_rate)
                    },
                    &context,
                    &CancellationToken::new(),
                )
                .await
        }
        Collapser::Blocking(collapser) => {
            let collapser = Arc::clone(collapser);
            let stats = Arc::clone(&workload.stats);
            let call = tokio::task::spawn_blocking(move || {
                collapser.execute(
                    |_, _| {
                        std::thread::sleep(work);
                        outcome(&stats, failure_rate)
                    },
                    &context,
                    &CancellationToken::new(),
                )
            });
            // the collapser catches panics, so this only fails when shutting down
            call.await.unwrap_or(Err(CollapseError::Cancelled))
        }
    };

    if let Err(error) = result {
        if error.is_cancellation() {
            workload.stats.cancellations.fetch_add(1, Ordering::Relaxed);
        } else {
            workload.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}
