//! Process task integration tests against real system binaries.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskchain::{
    LineListOutputProcessor, ProcessEnvironment, ProcessSpec, ProcessTask, StringOutputProcessor,
    TaskError, TaskManager, TaskState,
};

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn wait_for_pid(task: &Arc<taskchain::Task>) -> u32 {
    for _ in 0..200 {
        if let Some(pid) = task.pid() {
            return pid;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("process never reported a pid");
}

#[tokio::test]
async fn echo_produces_one_output_line_and_a_zero_exit() {
    init_logs();
    let manager = TaskManager::new();
    let task = ProcessTask::new("echo-hello", ProcessEnvironment::default());
    task.configure_process(
        ProcessSpec::new("echo").arg("hello"),
        Some(Box::new(StringOutputProcessor::new())),
    )
    .unwrap();

    let outputs = Arc::new(Mutex::new(Vec::new()));
    let sink = outputs.clone();
    task.on_output(move |line| sink.lock().unwrap().push(line.to_string()))
        .unwrap();
    let started = Arc::new(AtomicBool::new(false));
    let started_flag = started.clone();
    task.on_start_process(move |pid| {
        assert!(pid > 0);
        started_flag.store(true, Ordering::SeqCst);
    })
    .unwrap();

    manager.schedule(&task).unwrap();
    task.wait().await;

    assert!(started.load(Ordering::SeqCst));
    assert_eq!(*outputs.lock().unwrap(), vec!["hello".to_string()]);
    assert_eq!(task.result(), Some(serde_json::json!("hello")));
    assert_eq!(task.exit_code(), Some(0));
    assert_eq!(task.state(), TaskState::Succeeded);
    manager.stop().await;
}

#[tokio::test]
async fn nonzero_exit_faults_with_a_process_exit_error() {
    let manager = TaskManager::new();
    let task = ProcessTask::new("just-fails", ProcessEnvironment::default());
    task.configure_process(ProcessSpec::new("false"), None).unwrap();

    let ended = Arc::new(AtomicBool::new(false));
    let ended_flag = ended.clone();
    task.on_end_process(move || {
        ended_flag.store(true, Ordering::SeqCst);
    })
    .unwrap();

    manager.schedule(&task).unwrap();
    task.wait().await;

    assert_eq!(task.state(), TaskState::Faulted);
    assert!(ended.load(Ordering::SeqCst));
    match task.fault().as_deref() {
        Some(TaskError::ProcessExit { exit_code, .. }) => assert_eq!(*exit_code, 1),
        other => panic!("expected ProcessExit fault, got {other:?}"),
    }
    assert_eq!(task.exit_code(), Some(1));
    manager.stop().await;
}

#[tokio::test]
async fn empty_argv_spawns_with_the_program_alone() {
    let manager = TaskManager::new();
    let task = ProcessTask::new("bare-true", ProcessEnvironment::default());
    task.configure_process(ProcessSpec::new("true"), None).unwrap();

    manager.schedule(&task).unwrap();
    task.wait().await;

    assert_eq!(task.state(), TaskState::Succeeded);
    assert_eq!(task.exit_code(), Some(0));
    manager.stop().await;
}

#[tokio::test]
async fn zero_byte_stdout_yields_the_string_marker_and_the_empty_aggregate() {
    let manager = TaskManager::new();

    let string_task = ProcessTask::new("silent-string", ProcessEnvironment::default());
    string_task
        .configure_process(
            ProcessSpec::new("true"),
            Some(Box::new(StringOutputProcessor::new())),
        )
        .unwrap();
    manager.schedule(&string_task).unwrap();
    string_task.wait().await;
    assert_eq!(string_task.result(), Some(serde_json::json!("Process running")));

    let list_task = ProcessTask::new("silent-list", ProcessEnvironment::default());
    list_task
        .configure_process(
            ProcessSpec::new("true"),
            Some(Box::new(LineListOutputProcessor::new())),
        )
        .unwrap();
    manager.schedule(&list_task).unwrap();
    list_task.wait().await;
    assert_eq!(list_task.result(), Some(serde_json::json!([])));

    manager.stop().await;
}

#[tokio::test]
async fn stderr_lines_are_collected_and_observed() {
    let manager = TaskManager::new();
    let task = ProcessTask::new("stderr-writer", ProcessEnvironment::default());
    task.configure_process(
        ProcessSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]),
        None,
    )
    .unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    task.on_error_data(move |line| sink.lock().unwrap().push(line.to_string()))
        .unwrap();

    manager.schedule(&task).unwrap();
    task.wait().await;

    assert_eq!(*errors.lock().unwrap(), vec!["oops".to_string()]);
    assert_eq!(task.process_errors(), vec!["oops".to_string()]);
    match task.fault().as_deref() {
        Some(TaskError::ProcessExit { exit_code, errors }) => {
            assert_eq!(*exit_code, 3);
            assert!(errors.contains("oops"));
        }
        other => panic!("expected ProcessExit fault, got {other:?}"),
    }
    manager.stop().await;
}

#[tokio::test]
async fn stdin_lines_reach_the_child() {
    let manager = TaskManager::new();
    let task = ProcessTask::new("cat-loop", ProcessEnvironment::default());
    task.configure_process(ProcessSpec::new("cat"), None).unwrap();

    let outputs = Arc::new(Mutex::new(Vec::new()));
    let sink = outputs.clone();
    task.on_output(move |line| sink.lock().unwrap().push(line.to_string()))
        .unwrap();

    manager.schedule(&task).unwrap();
    wait_for_pid(&task).await;

    task.write_stdin("hello from stdin").unwrap();
    for _ in 0..200 {
        if !outputs.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(*outputs.lock().unwrap(), vec!["hello from stdin".to_string()]);

    // Stop closes stdin; cat exits on EOF inside the grace period, and the
    // task still ends Canceled because stopping was requested.
    task.stop_process().unwrap();
    task.wait().await;
    assert_eq!(task.state(), TaskState::Canceled);
    manager.stop().await;
}

#[tokio::test]
async fn stop_kills_a_process_that_ignores_stdin_eof() {
    let manager = TaskManager::new();
    let task = ProcessTask::new("sleeper", ProcessEnvironment::default());
    task.configure_process(ProcessSpec::new("sleep").arg("30"), None).unwrap();

    manager.schedule(&task).unwrap();
    wait_for_pid(&task).await;

    let stopping = std::time::Instant::now();
    task.stop_process().unwrap();
    task.wait().await;

    assert_eq!(task.state(), TaskState::Canceled);
    // Grace period plus kill, not the full 30 seconds.
    assert!(stopping.elapsed() < Duration::from_secs(5));
    manager.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn detach_succeeds_immediately_and_leaves_the_process_alive() {
    let manager = TaskManager::new();
    let task = ProcessTask::new("detached-sleeper", ProcessEnvironment::default());
    task.configure_process(ProcessSpec::new("sleep").arg("30"), None).unwrap();

    let ended = Arc::new(AtomicUsize::new(0));
    let ended_count = ended.clone();
    task.on_end_process(move || {
        ended_count.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    manager.schedule(&task).unwrap();
    let pid = wait_for_pid(&task).await;

    task.detach().unwrap();
    tokio::time::timeout(Duration::from_millis(500), task.wait())
        .await
        .expect("detached task did not finish promptly");
    assert_eq!(task.state(), TaskState::Succeeded);
    assert_eq!(ended.load(Ordering::SeqCst), 1);

    // Shutdown must not touch the detached process.
    manager.stop().await;
    let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
    assert!(alive, "detached process was killed");

    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[tokio::test]
async fn refused_spawns_surface_as_spawn_faults() {
    let manager = TaskManager::new();
    let task = ProcessTask::new("ghost", ProcessEnvironment::default());
    task.configure_process(ProcessSpec::new("definitely-not-a-real-binary-here"), None)
        .unwrap();

    manager.schedule(&task).unwrap();
    task.wait().await;

    assert_eq!(task.state(), TaskState::Faulted);
    assert!(matches!(
        task.fault().as_deref(),
        Some(TaskError::Spawn { .. })
    ));
    manager.stop().await;
}

#[tokio::test]
async fn unconfigured_process_tasks_fault_with_a_state_error() {
    let manager = TaskManager::new();
    let task = ProcessTask::new("unconfigured", ProcessEnvironment::default());

    manager.schedule(&task).unwrap();
    task.wait().await;

    assert_eq!(task.state(), TaskState::Faulted);
    assert!(matches!(task.fault().as_deref(), Some(TaskError::State(_))));
    manager.stop().await;
}

#[tokio::test]
async fn process_results_flow_into_chain_continuations() {
    let manager = TaskManager::new();
    let task = ProcessTask::new("emit", ProcessEnvironment::default());
    task.configure_process(
        ProcessSpec::new("echo").arg("chained"),
        Some(Box::new(StringOutputProcessor::new())),
    )
    .unwrap();

    let upper = taskchain::Task::func_from_input(
        "uppercase",
        taskchain::Affinity::Concurrent,
        |_, text: String| Ok(text.to_uppercase()),
    );
    task.then(upper.clone());

    manager.schedule(&task).unwrap();
    upper.wait().await;

    assert_eq!(upper.result_as::<String>().as_deref(), Some("CHAINED"));
    manager.stop().await;
}
