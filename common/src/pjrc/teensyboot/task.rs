use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::pjrc::teensyboot::message::{self, Message};
use crate::pjrc::teensyboot::{adjust_timeout, Error, Result};

const DEFAULT_MAX_WORKERS: usize = 16;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(10000);

// Task -------------------------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone)]
pub enum TaskStatus {
    Ready,
    Pending,
    Running,
    Finished,
}

type TaskBody = Box<dyn FnOnce(&Arc<Task>) -> Result<()> + Send>;
type TaskFinalize = Box<dyn FnOnce() + Send>;
pub type TaskMessageCallback = Box<dyn Fn(&Message) + Send + Sync>;

struct TaskState {
    status: TaskStatus,
    ret: Option<Result<()>>,
    body: Option<TaskBody>,
    finalize: Option<TaskFinalize>,
    result: Option<Box<dyn Any + Send + Sync>>,
    pool: Option<Pool>,
}

///
/// One long-running operation, executed by a pool worker or inline.
///
/// Status moves monotonically READY → PENDING → RUNNING → FINISHED; every transition is
/// broadcast to waiters and reported as a STATUS message. The optional typed result is
/// set by the task body (e.g. the firmware an upload ended up flashing).
///
pub struct Task {
    name: String,
    state: Mutex<TaskState>,
    cond: Condvar,
    callback: Mutex<Option<TaskMessageCallback>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("status", &self.state.lock().unwrap().status)
            .finish()
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

/// Name of the task running on this thread, used as message context.
pub(crate) fn current_task_name() -> Option<String> {
    CURRENT_TASK.with(|current| current.borrow().as_ref().map(|task| task.name.clone()))
}

/// Forward a message to the callback of the task running on this thread, if any.
pub(crate) fn dispatch_to_current(msg: &Message) {
    let task = CURRENT_TASK.with(|current| current.borrow().clone());
    if let Some(task) = task {
        let callback = task.callback.lock().unwrap();
        if let Some(callback) = callback.as_ref() {
            callback(msg);
        }
    }
}

impl Task {
    pub fn new(name: &str, body: impl FnOnce(&Arc<Task>) -> Result<()> + Send + 'static) -> Arc<Task> {
        Arc::new(Task {
            name: name.to_string(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Ready,
                ret: None,
                body: Some(Box::new(body)),
                finalize: None,
                result: None,
                pool: None,
            }),
            cond: Condvar::new(),
            callback: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().unwrap().status
    }

    /// Outcome of the task body, `None` until the task has finished.
    pub fn ret(&self) -> Option<Result<()>> {
        self.state.lock().unwrap().ret.clone()
    }

    /// Receive a copy of every message emitted while this task runs.
    pub fn set_callback(&self, callback: TaskMessageCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Run once after the task body, even if the task is dropped unstarted.
    pub(crate) fn set_finalize(&self, finalize: impl FnOnce() + Send + 'static) {
        self.state.lock().unwrap().finalize = Some(Box::new(finalize));
    }

    pub fn set_result<T: Any + Send + Sync>(&self, result: T) {
        self.state.lock().unwrap().result = Some(Box::new(result));
    }

    pub fn result<T: Any + Clone>(&self) -> Option<T> {
        let st = self.state.lock().unwrap();
        st.result.as_ref().and_then(|result| result.downcast_ref::<T>().cloned())
    }

    /// Assign the pool used by `start`, the shared default pool otherwise.
    pub fn set_pool(&self, pool: &Pool) {
        self.state.lock().unwrap().pool = Some(pool.clone());
    }

    fn change_status(&self, status: TaskStatus) {
        {
            let mut st = self.state.lock().unwrap();
            st.status = status;
        }
        self.cond.notify_all();

        // Status messages go to the sink and to this task's own callback, not to the
        // callback of whatever task happens to run on the calling thread.
        message::task_status(&self.name, status);
        let callback = self.callback.lock().unwrap();
        if let Some(callback) = callback.as_ref() {
            callback(&Message::Status { task: &self.name, status });
        }
    }

    fn run(self: &Arc<Task>) {
        let previous = CURRENT_TASK.with(|current| current.borrow_mut().replace(self.clone()));

        self.change_status(TaskStatus::Running);

        let body = self.state.lock().unwrap().body.take();
        let ret = match body {
            Some(body) => body(self),
            None => Ok(()),
        };

        let finalize = self.state.lock().unwrap().finalize.take();
        if let Some(finalize) = finalize {
            finalize();
        }

        self.state.lock().unwrap().ret = Some(ret);
        self.change_status(TaskStatus::Finished);

        CURRENT_TASK.with(|current| *current.borrow_mut() = previous);
    }

    /// Queue the task on its pool, spawning a worker when all are busy.
    pub fn start(self: &Arc<Task>) -> Result<()> {
        let pool = {
            let mut st = self.state.lock().unwrap();
            if st.status != TaskStatus::Ready {
                return Err(message::report(Error::Param(format!(
                    "Task '{}' has already been started",
                    self.name
                ))));
            }

            match &st.pool {
                Some(pool) => pool.clone(),
                None => {
                    let pool = Pool::default_pool().clone();
                    st.pool = Some(pool.clone());
                    pool
                }
            }
        };

        pool.submit(self)
    }

    ///
    /// Block until the task reaches `until`, with an optional timeout.
    ///
    /// Waiting for FINISHED without a timeout takes a fast path: a task still waiting in
    /// the queue (or never started) is pulled out and executed right here on the calling
    /// thread. Returns whether the status was reached.
    ///
    pub fn wait(self: &Arc<Task>, until: TaskStatus, timeout: Option<Duration>) -> Result<bool> {
        if until == TaskStatus::Finished && timeout.is_none() {
            let pool = {
                let st = self.state.lock().unwrap();
                if st.status == TaskStatus::Pending { st.pool.clone() } else { None }
            };
            if let Some(pool) = pool {
                pool.cancel(self);
            }

            if self.status() == TaskStatus::Ready {
                self.run();
                return Ok(true);
            }
        } else if self.status() == TaskStatus::Ready {
            self.start()?;
        }

        let start = Instant::now();
        let mut st = self.state.lock().unwrap();
        while st.status < until {
            let remaining = adjust_timeout(timeout, start);
            if remaining == Some(Duration::ZERO) {
                break;
            }

            st = match remaining {
                Some(remaining) => self.cond.wait_timeout(st, remaining).unwrap().0,
                None => self.cond.wait(st).unwrap(),
            };
        }

        Ok(st.status >= until)
    }

    /// Wait for completion and return the task outcome.
    pub fn join(self: &Arc<Task>) -> Result<()> {
        self.wait(TaskStatus::Finished, None)?;
        self.ret().unwrap_or(Ok(()))
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // A task dropped before running still owes its finalizer (e.g. releasing the
        // board it was created for).
        let finalize = self.state.lock().unwrap().finalize.take();
        if let Some(finalize) = finalize {
            finalize();
        }
    }
}

// Pool -------------------------------------------------------------------------------------------

struct PoolState {
    pending: VecDeque<Arc<Task>>,
    handles: Vec<std::thread::JoinHandle<()>>,
    workers: usize,
    busy: usize,
    max_workers: usize,
    idle_timeout: Duration,
    open: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    cond: Condvar,
}

///
/// Worker thread pool running tasks in FIFO order.
///
/// Workers are spawned on demand up to the maximum and exit after the idle timeout.
/// `shutdown` discards tasks still waiting in the queue, lets running tasks finish and
/// joins every worker.
///
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new() -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    pending: VecDeque::new(),
                    handles: Vec::new(),
                    workers: 0,
                    busy: 0,
                    max_workers: DEFAULT_MAX_WORKERS,
                    idle_timeout: DEFAULT_IDLE_TIMEOUT,
                    open: true,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// The process-wide pool used by tasks without an explicit one. Never shut down.
    pub fn default_pool() -> &'static Pool {
        static DEFAULT_POOL: OnceLock<Pool> = OnceLock::new();
        DEFAULT_POOL.get_or_init(Pool::new)
    }

    pub fn set_max_workers(&self, max: usize) {
        let mut st = self.inner.state.lock().unwrap();
        st.max_workers = max;
        self.inner.cond.notify_all();
    }

    pub fn max_workers(&self) -> usize {
        self.inner.state.lock().unwrap().max_workers
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        let mut st = self.inner.state.lock().unwrap();
        st.idle_timeout = timeout;
        self.inner.cond.notify_all();
    }

    fn submit(&self, task: &Arc<Task>) -> Result<()> {
        let mut st = self.inner.state.lock().unwrap();
        if !st.open {
            return Err(message::report(Error::Other(format!(
                "Cannot start task '{}' on a pool being shut down",
                task.name()
            ))));
        }

        if st.busy == st.workers && st.workers < st.max_workers {
            let inner = self.inner.clone();
            let handle = std::thread::spawn(move || worker_main(inner));
            st.handles.push(handle);
            st.workers += 1;
            st.busy += 1;
        }

        // Still under the pool lock: no worker can pick the task up before it is PENDING
        task.change_status(TaskStatus::Pending);
        st.pending.push_back(task.clone());
        self.inner.cond.notify_one();

        Ok(())
    }

    /// Pull a pending task back out of the queue, making it READY again.
    fn cancel(&self, task: &Arc<Task>) {
        let mut st = self.inner.state.lock().unwrap();
        let before = st.pending.len();
        st.pending.retain(|it| !Arc::ptr_eq(it, task));

        if st.pending.len() != before {
            drop(st);
            task.state.lock().unwrap().status = TaskStatus::Ready;
        }
    }

    /// Discard queued tasks, join every worker. Running tasks complete first.
    pub fn shutdown(&self) {
        let handles = {
            let mut st = self.inner.state.lock().unwrap();
            st.open = false;
            st.pending.clear();
            self.inner.cond.notify_all();
            std::mem::take(&mut st.handles)
        };

        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Default for Pool {
    fn default() -> Pool {
        Pool::new()
    }
}

fn worker_main(inner: Arc<PoolInner>) {
    let mut st = inner.state.lock().unwrap();

    loop {
        st.busy -= 1;

        let start = Instant::now();
        let mut can_wait = true;
        let task = loop {
            if !st.open || st.workers > st.max_workers {
                st.workers -= 1;
                return;
            }
            if let Some(task) = st.pending.pop_front() {
                break task;
            }
            if !can_wait {
                st.workers -= 1;
                return;
            }

            let remaining = st.idle_timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                st.workers -= 1;
                return;
            }

            let (guard, wait) = inner.cond.wait_timeout(st, remaining).unwrap();
            st = guard;
            can_wait = !wait.timed_out();
        };

        st.busy += 1;
        drop(st);

        task.run();

        st = inner.state.lock().unwrap();
    }
}
