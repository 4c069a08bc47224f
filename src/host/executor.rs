use std::io;
use std::panic;
use std::sync::mpsc;
use std::thread;

use parking_lot::Mutex;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs work off the calling thread.
///
/// A connection cannot tear itself down from its own duty cycle, since teardown joins that
/// thread. Timeouts are therefore handed to an executor.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Single background thread fed by a channel. Tasks run in submission order.
pub struct BackgroundExecutor {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BackgroundExecutor {
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();

        let thread = thread::Builder::new()
            .name("kestrel-executor".into())
            .spawn(move || {
                // Exits once every sender is gone and the queue is drained
                while let Ok(task) = rx.recv() {
                    if panic::catch_unwind(panic::AssertUnwindSafe(task)).is_err() {
                        tracing::error!("deferred task panicked");
                    }
                }
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl Executor for BackgroundExecutor {
    fn execute(&self, task: Task) {
        if let Some(tx) = &*self.tx.lock() {
            let _ = tx.send(task);
        }
    }
}

impl Drop for BackgroundExecutor {
    fn drop(&mut self) {
        self.tx.lock().take();

        if let Some(thread) = self.thread.lock().take() {
            // The last reference may be released by one of our own tasks
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}
