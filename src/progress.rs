//! Cross-task progress aggregation.
//!
//! Every running task pushes its progress record to the manager's
//! [`ProgressReporter`]. The reporter is a channel-fed actor that serializes
//! delivery to subscribers and throttles per-task emission to at most one
//! event per 100 ms, always letting the final (terminal) update through.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::trace;

use crate::task::core::Task;
use crate::task::types::{HandlerId, Progress, TaskId};

/// Minimum spacing between emissions for one task.
const THROTTLE: Duration = Duration::from_millis(100);
/// How often the actor re-checks deferred updates.
const FLUSH_TICK: Duration = Duration::from_millis(25);

/// An aggregated progress event, as seen by reporter subscribers.
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub task_name: String,
    pub progress: Progress,
    pub timestamp: DateTime<Utc>,
    /// Set on the last update a task will ever publish.
    pub finished: bool,
}

type Subscriber = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;
type SubscriberList = Arc<Mutex<Vec<(u64, Subscriber)>>>;

pub(crate) struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    subscribers: SubscriberList,
    next_id: AtomicU64,
}

struct Entry {
    last_emit: Instant,
    pending: Option<ProgressEvent>,
}

impl ProgressReporter {
    pub(crate) fn new(handle: &Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let subscribers: SubscriberList = Arc::new(Mutex::new(Vec::new()));
        handle.spawn(reporter_loop(rx, subscribers.clone()));
        Self {
            tx,
            subscribers,
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn report(&self, task: &Arc<Task>, progress: &Progress, finished: bool) {
        let event = ProgressEvent {
            task_id: task.id(),
            task_name: task.name().to_string(),
            progress: progress.clone(),
            timestamp: Utc::now(),
            finished,
        };
        // Send failure just means the actor is gone (runtime teardown).
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(
        &self,
        subscriber: impl Fn(&ProgressEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(subscriber)));
        HandlerId(id)
    }

    pub(crate) fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut list = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = list.len();
        list.retain(|(sid, _)| *sid != id.0);
        before != list.len()
    }
}

async fn reporter_loop(mut rx: mpsc::UnboundedReceiver<ProgressEvent>, subscribers: SubscriberList) {
    let mut entries: HashMap<TaskId, Entry> = HashMap::new();
    let mut tick = tokio::time::interval(FLUSH_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(event) => handle_event(event, &mut entries, &subscribers),
                    None => {
                        // Manager dropped: flush whatever was deferred.
                        for (_, entry) in entries.drain() {
                            if let Some(event) = entry.pending {
                                emit(&subscribers, &event);
                            }
                        }
                        return;
                    }
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                for entry in entries.values_mut() {
                    if entry.pending.is_some() && now.duration_since(entry.last_emit) >= THROTTLE {
                        if let Some(event) = entry.pending.take() {
                            entry.last_emit = now;
                            emit(&subscribers, &event);
                        }
                    }
                }
                entries.retain(|_, entry| entry.pending.is_some() || entry.last_emit.elapsed() < Duration::from_secs(60));
            }
        }
    }
}

fn handle_event(
    event: ProgressEvent,
    entries: &mut HashMap<TaskId, Entry>,
    subscribers: &SubscriberList,
) {
    let now = Instant::now();
    if event.finished {
        // Terminal updates bypass the throttle and supersede anything
        // deferred for the task.
        entries.remove(&event.task_id);
        emit(subscribers, &event);
        return;
    }
    let entry = entries.entry(event.task_id).or_insert(Entry {
        last_emit: now - THROTTLE,
        pending: None,
    });
    if now.duration_since(entry.last_emit) >= THROTTLE {
        entry.last_emit = now;
        entry.pending = None;
        emit(subscribers, &event);
    } else {
        trace!(task = %event.task_name, "progress update deferred");
        entry.pending = Some(event);
    }
}

fn emit(subscribers: &SubscriberList, event: &ProgressEvent) {
    let list = subscribers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .to_vec();
    for (_, subscriber) in list {
        subscriber(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::core::Task as CoreTask;
    use crate::task::types::Affinity;

    fn probe_task() -> Arc<CoreTask> {
        CoreTask::action("probe", Affinity::Concurrent, |_| Ok(()))
    }

    #[tokio::test]
    async fn rapid_updates_are_coalesced_but_the_last_one_lands() {
        let reporter = ProgressReporter::new(&Handle::current());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        reporter.subscribe(move |event: &ProgressEvent| {
            sink.lock().unwrap().push(event.progress.current);
        });

        let task = probe_task();
        task.assign_id(7);
        for i in 0..50u64 {
            reporter.report(&task, &Progress::new(i, 50, "step"), false);
        }
        reporter.report(&task, &Progress::new(50, 50, "done"), true);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let seen = seen.lock().unwrap();
        // 50 rapid updates collapse to far fewer emissions...
        assert!(seen.len() < 10, "expected coalescing, saw {} events", seen.len());
        // ...but the final update always lands.
        assert_eq!(*seen.last().unwrap(), 50);
    }

    #[tokio::test]
    async fn unsubscribed_handlers_see_nothing() {
        let reporter = ProgressReporter::new(&Handle::current());
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let id = reporter.subscribe(move |_: &ProgressEvent| {
            *sink.lock().unwrap() += 1;
        });
        assert!(reporter.unsubscribe(id));

        let task = probe_task();
        reporter.report(&task, &Progress::new(1, 2, "x"), true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
