//! End-to-end chain behavior through the public embedding API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskchain::{Affinity, Predicate, Task, TaskManager, TaskQueue, TaskState};

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test]
async fn a_mixed_affinity_pipeline_carries_values_end_to_end() {
    init_logs();
    let manager = TaskManager::new();

    let fetch = Task::func("fetch", Affinity::LongRunning, |ctx| {
        ctx.report(1, 3, "fetching");
        Ok(vec!["alpha".to_string(), "beta".to_string()])
    });
    let index = Task::func_from_input(
        "index",
        Affinity::Exclusive,
        |ctx, items: Vec<String>| {
            ctx.report(2, 3, "indexing");
            Ok(items.join(","))
        },
    );
    let announce = Task::func_from_input("announce", Affinity::Concurrent, |ctx, joined: String| {
        ctx.report(3, 3, "announcing");
        Ok(format!("indexed: {joined}"))
    });

    let tail = fetch.then(index.clone()).then(announce.clone());
    manager.schedule(&tail).unwrap();
    announce.wait().await;

    assert_eq!(fetch.state(), TaskState::Succeeded);
    assert_eq!(index.result_as::<String>().as_deref(), Some("alpha,beta"));
    assert_eq!(
        announce.result_as::<String>().as_deref(),
        Some("indexed: alpha,beta")
    );
    manager.stop().await;
}

#[tokio::test]
async fn manager_progress_subscribers_observe_final_updates() {
    let manager = TaskManager::new();
    let finals = Arc::new(Mutex::new(Vec::new()));
    let sink = finals.clone();
    manager.on_progress(move |event| {
        if event.finished {
            sink.lock().unwrap().push(event.task_name.clone());
        }
    });

    let task = Task::action("tracked", Affinity::Concurrent, |ctx| {
        for step in 0..20 {
            ctx.report(step, 20, "working");
        }
        Ok(())
    });
    manager.schedule(&task).unwrap();
    task.wait().await;

    // The reporter is an async actor; give it a beat to drain.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(finals.lock().unwrap().contains(&"tracked".to_string()));
    manager.stop().await;
}

#[tokio::test]
async fn failures_in_the_middle_of_a_chain_reach_the_cleanup_stage() {
    let manager = TaskManager::new();
    let cleanups = Arc::new(AtomicUsize::new(0));

    let prepare = Task::func("prepare", Affinity::Concurrent, |_| Ok(1u32));
    let explode = Task::func_from_input(
        "explode",
        Affinity::Concurrent,
        |_, _n: u32| -> anyhow::Result<u32> { anyhow::bail!("mid-chain failure") },
    );
    let publish = Task::action("publish", Affinity::Concurrent, |_| Ok(()));
    let counter = cleanups.clone();
    let cleanup = Task::action("cleanup", Affinity::Concurrent, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    prepare.then(explode.clone());
    explode.then(publish.clone());
    explode.then_on(cleanup.clone(), Predicate::Always);

    manager.schedule(&prepare).unwrap();
    cleanup.wait().await;
    publish.wait().await;

    assert_eq!(explode.state(), TaskState::Faulted);
    assert_eq!(publish.state(), TaskState::Canceled);
    assert!(publish.dependency_failed());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(
        cleanup
            .previous_fault()
            .unwrap()
            .to_string()
            .contains("mid-chain failure")
    );
    manager.stop().await;
}

#[tokio::test]
async fn a_queue_feeding_a_continuation_behaves_like_a_batch_download() {
    let manager = TaskManager::new();

    let mut queue = TaskQueue::new("download-batch");
    for name in ["a.pack", "b.pack", "c.pack"] {
        queue = queue.push(Task::func(
            format!("download-{name}"),
            Affinity::Concurrent,
            move |_| Ok(name.to_string()),
        ));
    }
    let batch = queue.build();

    let summarize = Task::func_from_input(
        "summarize",
        Affinity::Concurrent,
        |_, files: Vec<String>| Ok(files.len()),
    );
    batch.then(summarize.clone());

    manager.schedule(&batch).unwrap();
    summarize.wait().await;

    assert_eq!(summarize.result_as::<usize>(), Some(3));
    manager.stop().await;
}

#[tokio::test]
async fn token_scoped_tasks_cancel_without_touching_their_siblings() {
    let manager = TaskManager::new();

    let scoped_token = manager.token().child_token();
    let doomed = Task::action("doomed", Affinity::LongRunning, |ctx| {
        while !ctx.token.is_cancelled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(anyhow::Error::new(taskchain::TaskError::Canceled))
    });
    doomed.set_token(scoped_token.clone()).unwrap();
    let healthy = Task::action("healthy", Affinity::Concurrent, |_| Ok(()));

    manager.schedule(&doomed).unwrap();
    manager.schedule(&healthy).unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    scoped_token.cancel();

    doomed.wait().await;
    healthy.wait().await;
    assert_eq!(doomed.state(), TaskState::Canceled);
    assert_eq!(healthy.state(), TaskState::Succeeded);
    manager.stop().await;
}
