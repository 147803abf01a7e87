use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use rescore::resource::{BoxError, CachedResource, FnLoader, ResourceError};
use rescore::task::{Task, TaskError, TaskScheduler, while_task};

fn slow_counter(calls: &Arc<AtomicUsize>) -> CachedResource<u32, usize> {
    let calls = Arc::clone(calls);
    CachedResource::with_loader(
        "slow",
        FnLoader::new(move |keys: Vec<u32>| {
            let calls = Arc::clone(&calls);
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, BoxError>(keys.into_iter().map(|key| (key, call)).collect())
            }
        }),
    )
}

#[tokio::test(start_paused = true)]
async fn polling_waits_for_a_resource_to_become_fresh() {
    let calls = Arc::new(AtomicUsize::new(0));
    let resource = slow_counter(&calls);

    let probe = resource.clone();
    let polled = while_task(
        |loaded: &bool| *loaded,
        move || {
            let probe = probe.clone();
            Task::from_future(async move {
                let handle = probe.start_load(1_u32);
                Ok::<_, TaskError>(handle.is_cached())
            })
        },
        Duration::from_millis(30),
        Some(Duration::from_secs(1)),
    );

    assert!(polled.wait().await.expect("resource became fresh"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(resource.get(&1), Some(1));
}

#[tokio::test(start_paused = true)]
async fn polling_times_out_while_loads_keep_failing() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    let broken: CachedResource<u32, String> = CachedResource::with_loader(
        "broken",
        FnLoader::new(move |_keys: Vec<u32>| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err::<Vec<(u32, String)>, BoxError>("still down".into())
            }
        }),
    );

    let probe = broken.clone();
    let polled = while_task(
        |value: &Option<String>| value.is_some(),
        move || {
            let probe = probe.clone();
            Task::from_future(async move {
                match probe.refresh(5_u32).await {
                    Ok(mut values) => Ok(values.pop().map(|(_, value)| value)),
                    Err(ResourceError::Load { .. }) => Ok(None),
                    Err(other) => Err(TaskError::from(other)),
                }
            })
        },
        Duration::from_millis(20),
        Some(Duration::from_millis(100)),
    );

    let err = polled.wait().await.expect_err("never recovers");
    assert!(err.is_timeout());
    assert!(polled.is_cancelled());
    assert!(attempts.load(Ordering::SeqCst) >= 2);
    assert!(broken.is_error(&5));
}

#[tokio::test(start_paused = true)]
async fn scheduler_serializes_refreshes_of_one_document() {
    let calls = Arc::new(AtomicUsize::new(0));
    let resource = slow_counter(&calls);
    let scheduler: TaskScheduler<u32> = TaskScheduler::new("refresh");
    let order = Arc::new(Mutex::new(Vec::new()));

    let tasks: Vec<Task<usize>> = (0..3)
        .map(|round| {
            let resource = resource.clone();
            let order = Arc::clone(&order);
            scheduler.schedule(7, move |_| async move {
                order.lock().unwrap().push(format!("start {round}"));
                let value = resource.refresh(7_u32).await?;
                order.lock().unwrap().push(format!("end {round}"));
                Ok::<_, TaskError>(value[0].1)
            })
        })
        .collect();

    let mut results = Vec::new();
    for task in &tasks {
        results.push(task.wait().await.expect("refresh"));
    }

    assert_eq!(results, vec![1, 2, 3]);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
    );
    assert!(!scheduler.is_executing(&7));
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_scheduled_refresh_leaves_the_lane_usable() {
    let calls = Arc::new(AtomicUsize::new(0));
    let resource = slow_counter(&calls);
    let scheduler: TaskScheduler<u32> = TaskScheduler::new("refresh");

    let first_resource = resource.clone();
    let first = scheduler.schedule(1, move |_| async move {
        first_resource.refresh(1_u32).await?;
        Ok::<_, TaskError>(())
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(first.cancel("superseded"));
    assert!(first.wait().await.expect_err("cancelled").is_cancelled());

    let second_resource = resource.clone();
    let second = scheduler.schedule(1, move |_| async move {
        let values = second_resource.load(1_u32).await?;
        Ok::<_, TaskError>(values.len())
    });
    assert_eq!(second.wait().await.expect("second runs"), 1);
}
