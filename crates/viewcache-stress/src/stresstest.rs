use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;
use viewcache_service::caching::Caches;
use viewcache_service::compile::CompilationCoordinator;
use viewcache_service::config::Config as ServiceConfig;
use viewcache_service::resolver::InMemoryTargetResolver;

use crate::workloads::{WorkloadsConfig, prepare_workload};

pub async fn perform_stresstest(
    service_config: ServiceConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let resolver = Arc::new(InMemoryTargetResolver::default());

    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let concurrency = workload.concurrency.max(1);
            let workload = prepare_workload(i, workload, &resolver)?;
            Ok::<_, anyhow::Error>((concurrency, Arc::new(workload)))
        })
        .collect::<Result<Vec<_>>>()?;

    let caches = Caches::from_config(&service_config, resolver);
    let coordinator = Arc::new(CompilationCoordinator::new(caches));

    // warmup: run each workload once to make sure the lock registry and caches are populated
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let coordinator = Arc::clone(&coordinator);
            let workload = Arc::clone(workload);
            tokio::spawn(async move { workload.run_once(&coordinator).await })
        });

        for result in futures::future::join_all(futures).await {
            result??;
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.iter() {
        let concurrency = *concurrency;
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let coordinator = Arc::clone(&coordinator);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let coordinator = Arc::clone(&coordinator);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            if let Err(error) = workload.run_once(&coordinator).await {
                                tracing::error!(error = %error, "Workload failed");
                            }

                            transaction.finish();

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            (concurrency, task_durations)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations) = task?;
        let workload = &workloads[i].1;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if ops > 0 {
            let seconds = |q| {
                let value = task_durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(value)
            };
            let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
            let (p50, p90, p99) = (seconds(0.5), seconds(0.9), seconds(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        println!(
            "  compilations: {} for {} distinct keys",
            workload.compilations(),
            workload.distinct_keys()
        );
    }
    println!("Lock registry entries: {}", coordinator.locks().len());

    Ok(())
}
