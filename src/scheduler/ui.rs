//! The UI execution surface.
//!
//! The engine never owns the host's UI loop; it only needs a way to post
//! runnables onto the thread that owns UI state, and to know that thread's
//! identity. [`UiDispatcher`] abstracts exactly that. Hosts inject their
//! own mechanism (main-loop post, message-pump dispatch); standalone
//! embedders and the test suite use [`ChannelDispatcher`], a dedicated
//! event-loop thread.

use std::sync::Mutex;
use std::thread::{JoinHandle, ThreadId};

use tokio::sync::mpsc;
use tracing::warn;

/// A unit of work posted onto the UI thread.
pub type Runnable = Box<dyn FnOnce() + Send>;

/// Capability to post runnables onto a single, known thread.
pub trait UiDispatcher: Send + Sync {
    /// The identity of the thread that executes posted runnables.
    fn thread_id(&self) -> ThreadId;

    /// Post a runnable for execution on the UI thread. Runnables execute
    /// in posting order.
    fn post(&self, runnable: Runnable);
}

/// A [`UiDispatcher`] backed by a dedicated event-loop thread.
pub struct ChannelDispatcher {
    tx: Mutex<Option<mpsc::UnboundedSender<Runnable>>>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelDispatcher {
    /// Spawn the event-loop thread and return the dispatcher.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Runnable>();
        let join = std::thread::spawn(move || {
            while let Some(runnable) = rx.blocking_recv() {
                runnable();
            }
        });
        let thread_id = join.thread().id();
        Self {
            tx: Mutex::new(Some(tx)),
            thread_id,
            join: Mutex::new(Some(join)),
        }
    }

    /// Close the queue and wait for the event loop to finish what was
    /// already posted.
    pub fn shutdown(&self) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(tx);
        let join = self
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = join {
            let _ = handle.join();
        }
    }
}

impl UiDispatcher for ChannelDispatcher {
    fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    fn post(&self, runnable: Runnable) {
        let guard = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(runnable).is_err() {
                    warn!("runnable dropped: dispatcher event loop has exited");
                }
            }
            None => warn!("runnable dropped: dispatcher is shut down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runnables_execute_on_the_dispatcher_thread_in_order() {
        let dispatcher = ChannelDispatcher::spawn();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let expected_thread = dispatcher.thread_id();

        for i in 0..4u32 {
            let seen = seen.clone();
            dispatcher.post(Box::new(move || {
                assert_eq!(std::thread::current().id(), expected_thread);
                seen.lock().unwrap().push(i);
            }));
        }
        dispatcher.shutdown();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn post_after_shutdown_is_dropped() {
        let dispatcher = ChannelDispatcher::spawn();
        dispatcher.shutdown();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        dispatcher.post(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
