use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::error::{IpcError, Result};

/// Cooperative cancellation flag shared between a supervisor and the code
/// running inside a task. Cancellation takes effect only where the running
/// code checks the token, never at an arbitrary instruction.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Scheduling policy applied to the task's native thread during its entry
/// phase. Pass-through configuration: the OS interprets it, this crate only
/// validates the policy/priority combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    #[default]
    Other,
    Fifo,
    RoundRobin,
}

impl SchedPolicy {
    fn as_raw(self) -> libc::c_int {
        match self {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
        }
    }
}

/// Construction-time knobs for a [`ManagedTask`]'s native thread.
#[derive(Debug, Clone, Default)]
pub struct TaskConfig {
    pub name: Option<String>,
    pub stack_size: Option<usize>,
    pub policy: SchedPolicy,
    pub priority: i32,
}

impl TaskConfig {
    pub fn named(name: &str) -> Self {
        TaskConfig {
            name: Some(name.to_string()),
            ..TaskConfig::default()
        }
    }

    fn validate(&self) -> Result<()> {
        let ok = match self.policy {
            SchedPolicy::Other => self.priority == 0,
            // Real-time policies require a static priority in [1, 99].
            SchedPolicy::Fifo | SchedPolicy::RoundRobin => (1..=99).contains(&self.priority),
        };
        if ok {
            Ok(())
        } else {
            Err(IpcError::UnsupportedMode)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Starting,
    Running,
    Cancelling,
    Exited,
}

/// The three phases of a task's life. `on_start` runs setup in the new
/// thread before `run()` returns to the caller; `run` is the task's actual
/// work and should check `cancel` at every blocking boundary; `on_exit` is
/// guaranteed to run exactly once on every exit path, including a panic in
/// `on_start` or `run`. A panicking body yields -1 from `join`.
pub trait TaskBody: Send + 'static {
    fn on_start(&mut self) {}
    fn run(&mut self, cancel: &CancelToken) -> i32;
    fn on_exit(&mut self) {}
}

/// A supervised native thread with a deterministic start/stop handshake.
///
/// `run()` does not return until the body's entry phase has completed in
/// the new thread, so any thread-local setup it performed (scheduling
/// priority, resource attachment) is visible to the caller. `cancel()` and
/// `join()` do not return until the body's exit phase has completed. The
/// handshake is a counting semaphore separate from the state lock: the
/// lock is deliberately held across the blocking waits, and sharing it with
/// the signal path would deadlock.
pub struct ManagedTask {
    inner: Mutex<Inner>,
    rendezvous: Arc<Semaphore>,
    cancel: CancelToken,
    config: TaskConfig,
    sched_rc: Arc<AtomicI32>,
}

struct Inner {
    state: TaskState,
    body: Option<Box<dyn TaskBody>>,
    handle: Option<JoinHandle<i32>>,
}

impl ManagedTask {
    pub fn new(config: TaskConfig, body: impl TaskBody) -> Result<Self> {
        config.validate()?;
        Ok(ManagedTask {
            inner: Mutex::new(Inner {
                state: TaskState::Idle,
                body: Some(Box::new(body)),
                handle: None,
            }),
            rendezvous: Arc::new(Semaphore::new()),
            cancel: CancelToken::new(),
            config,
            sched_rc: Arc::new(AtomicI32::new(0)),
        })
    }

    /// Start the task. Blocks until the body's `on_start` has finished in
    /// the new thread, then transitions to Running. An entry hook that
    /// panics does not block this call; the failure surfaces as -1 from
    /// [`join`](Self::join).
    pub fn run(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.state != TaskState::Idle {
            return Err(IpcError::AlreadyRunning);
        }
        let body = match inner.body.take() {
            Some(body) => body,
            None => return Err(IpcError::AlreadyRunning),
        };

        let mut builder = std::thread::Builder::new();
        if let Some(name) = &self.config.name {
            builder = builder.name(name.clone());
        }
        if let Some(stack) = self.config.stack_size {
            builder = builder.stack_size(stack);
        }

        let sem = Arc::clone(&self.rendezvous);
        let cancel = self.cancel.clone();
        let config = self.config.clone();
        let sched_rc = Arc::clone(&self.sched_rc);
        let handle = match builder.spawn(move || thread_main(body, sem, cancel, config, sched_rc)) {
            Ok(handle) => handle,
            Err(err) => {
                // The body went down with the failed spawn, so the task can
                // never start; finish it here instead of leaving an Idle
                // husk that would misreport AlreadyRunning on retry.
                inner.state = TaskState::Exited;
                return Err(IpcError::os(
                    "spawn",
                    err.to_string(),
                    err.raw_os_error().unwrap_or(0),
                ));
            }
        };

        inner.handle = Some(handle);
        inner.state = TaskState::Starting;
        // First rendezvous: entry phase done. Held across the state lock on
        // purpose; the thread only posts, it never takes the lock.
        self.rendezvous.wait();
        inner.state = TaskState::Running;
        Ok(())
    }

    /// Request cancellation and wait for the exit phase to complete.
    /// `NotRunning` unless the task is currently Running.
    pub fn cancel(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.state != TaskState::Running {
            return Err(IpcError::NotRunning);
        }
        inner.state = TaskState::Cancelling;
        self.cancel.cancel();
        // Second rendezvous: exit hook has run.
        self.rendezvous.wait();
        if let Some(handle) = inner.handle.take() {
            let _ = handle.join();
        }
        inner.state = TaskState::Exited;
        Ok(())
    }

    /// Wait for the task to finish and return the body's result. A body
    /// that panicked yields -1. `NotRunning` if the task already exited or
    /// never started.
    pub fn join(&self) -> Result<i32> {
        let mut inner = lock(&self.inner);
        if inner.state != TaskState::Running {
            return Err(IpcError::NotRunning);
        }
        self.rendezvous.wait();
        let code = match inner.handle.take() {
            Some(handle) => handle.join().unwrap_or(-1),
            None => -1,
        };
        inner.state = TaskState::Exited;
        Ok(code)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner).state == TaskState::Running
    }

    pub fn state(&self) -> TaskState {
        lock(&self.inner).state
    }

    /// Token handed to the body's `run`; exposed so collaborators blocked on
    /// the same buffer can share it.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Errno from the entry-phase scheduling call, 0 on success. Meaningful
    /// once `run()` has returned. Real-time policies commonly come back
    /// EPERM for unprivileged processes; the thread then stays on the
    /// default policy.
    pub fn sched_error(&self) -> i32 {
        self.sched_rc.load(Ordering::SeqCst)
    }
}

fn thread_main(
    body: Box<dyn TaskBody>,
    sem: Arc<Semaphore>,
    cancel: CancelToken,
    config: TaskConfig,
    sched_rc: Arc<AtomicI32>,
) -> i32 {
    sched_rc.store(apply_sched(&config), Ordering::SeqCst);
    let mut guard = ExitGuard { body, sem };
    // The entry hook may panic; the first rendezvous must be posted either
    // way or run() in the supervisor would never return. A caught panic is
    // re-raised after the post so the exit path below still runs and
    // join() observes the failure as -1.
    let entry = catch_unwind(AssertUnwindSafe(|| guard.body.on_start()));
    guard.sem.post();
    match entry {
        Ok(()) => guard.body.run(&cancel),
        Err(payload) => resume_unwind(payload),
    }
    // ExitGuard runs on_exit and posts the second rendezvous, on normal
    // return and on unwind alike.
}

struct ExitGuard {
    body: Box<dyn TaskBody>,
    sem: Arc<Semaphore>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.body.on_exit();
        self.sem.post();
    }
}

/// Entry-phase scheduling setup. Returns the pthread error number, 0 on
/// success; the caller records it rather than failing the task, so an
/// unprivileged EPERM leaves the thread on the default policy but is still
/// observable through [`ManagedTask::sched_error`].
fn apply_sched(config: &TaskConfig) -> libc::c_int {
    if config.policy == SchedPolicy::Other && config.priority == 0 {
        return 0;
    }
    let param = libc::sched_param {
        sched_priority: config.priority,
    };
    unsafe { libc::pthread_setschedparam(libc::pthread_self(), config.policy.as_raw(), &param) }
}

fn lock(m: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counting semaphore for the two lifecycle rendezvous points. std has no
/// semaphore; a Mutex/Condvar pair is the standard rendering. Must not be
/// the task's state lock: that lock is held across the waits.
struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Semaphore {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            count = self
                .cv
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicU32};
    use std::time::Duration;

    struct Recorder {
        entered: Arc<AtomicU32>,
        exited: Arc<AtomicU32>,
        result: i32,
        panic_in_run: bool,
        panic_in_on_start: bool,
        spin_until_cancelled: bool,
    }

    impl Recorder {
        fn new(entered: &Arc<AtomicU32>, exited: &Arc<AtomicU32>) -> Self {
            Recorder {
                entered: Arc::clone(entered),
                exited: Arc::clone(exited),
                result: 0,
                panic_in_run: false,
                panic_in_on_start: false,
                spin_until_cancelled: false,
            }
        }
    }

    impl TaskBody for Recorder {
        fn on_start(&mut self) {
            if self.panic_in_on_start {
                panic!("entry hook panic");
            }
            self.entered.fetch_add(1, Ordering::SeqCst);
        }

        fn run(&mut self, cancel: &CancelToken) -> i32 {
            if self.panic_in_run {
                panic!("body panic");
            }
            while self.spin_until_cancelled && !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            self.result
        }

        fn on_exit(&mut self) {
            self.exited.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn run_returns_only_after_the_entry_phase() {
        let entered = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));
        let task = ManagedTask::new(
            TaskConfig::named("task-entry"),
            Recorder::new(&entered, &exited),
        )
        .expect("new");

        task.run().expect("run");
        // Entry-phase effects are visible the instant run() returns.
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert!(task.is_running());
        task.join().expect("join");
    }

    #[test]
    fn join_returns_the_body_result_and_exit_runs_once() {
        let entered = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));
        let mut rec = Recorder::new(&entered, &exited);
        rec.result = 42;
        let task = ManagedTask::new(TaskConfig::default(), rec).expect("new");

        task.run().expect("run");
        assert_eq!(task.join().expect("join"), 42);
        assert_eq!(exited.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Exited);
    }

    #[test]
    fn cancel_stops_a_looping_body_and_waits_for_its_exit_hook() {
        let entered = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));
        let mut rec = Recorder::new(&entered, &exited);
        rec.spin_until_cancelled = true;
        let task = ManagedTask::new(TaskConfig::named("task-cancel"), rec).expect("new");

        task.run().expect("run");
        assert!(task.is_running());
        task.cancel().expect("cancel");
        // The exit hook had already run when cancel() returned.
        assert_eq!(exited.load(Ordering::SeqCst), 1);
        assert!(!task.is_running());
    }

    #[test]
    fn exit_hook_runs_exactly_once_even_when_the_body_panics() {
        let entered = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));
        let mut rec = Recorder::new(&entered, &exited);
        rec.panic_in_run = true;
        let task = ManagedTask::new(TaskConfig::default(), rec).expect("new");

        task.run().expect("run");
        assert_eq!(task.join().expect("join"), -1);
        assert_eq!(exited.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_panicking_entry_hook_still_lets_join_report_the_failure() {
        let entered = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));
        let mut rec = Recorder::new(&entered, &exited);
        rec.panic_in_on_start = true;
        let task = ManagedTask::new(TaskConfig::default(), rec).expect("new");

        // run() must come back even though the thread died during entry.
        task.run().expect("run");
        // join() must not hang on the dead thread and reports the panic.
        assert_eq!(task.join().expect("join"), -1);
        assert_eq!(exited.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Exited);
    }

    #[test]
    fn a_failed_spawn_finishes_the_task_instead_of_leaving_it_idle() {
        let entered = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));
        let cfg = TaskConfig {
            // No address space holds a stack this large; spawn must fail.
            stack_size: Some(1usize << 50),
            ..TaskConfig::named("task-nospawn")
        };
        let task = ManagedTask::new(cfg, Recorder::new(&entered, &exited)).expect("new");

        let err = task.run().expect_err("spawn cannot allocate that stack");
        assert!(matches!(err, IpcError::Os { op: "spawn", .. }));
        assert_eq!(task.state(), TaskState::Exited);
        assert_eq!(task.run().expect_err("no retry"), IpcError::AlreadyRunning);
        assert_eq!(task.join().expect_err("nothing ran"), IpcError::NotRunning);
        assert_eq!(entered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn the_entry_phase_scheduling_result_is_observable() {
        let entered = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));
        let task = ManagedTask::new(TaskConfig::default(), Recorder::new(&entered, &exited))
            .expect("new");
        task.run().expect("run");
        assert_eq!(task.sched_error(), 0);
        task.join().expect("join");

        let cfg = TaskConfig {
            policy: SchedPolicy::Fifo,
            priority: 5,
            ..TaskConfig::default()
        };
        let task = ManagedTask::new(cfg, Recorder::new(&entered, &exited)).expect("new");
        task.run().expect("run");
        // Succeeds under CAP_SYS_NICE, otherwise the kernel refuses; either
        // way the outcome is recorded instead of dropped.
        let rc = task.sched_error();
        assert!(rc == 0 || rc == libc::EPERM, "unexpected sched rc {rc}");
        task.join().expect("join");
    }

    #[test]
    fn lifecycle_misuse_is_reported() {
        let entered = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));
        let mut rec = Recorder::new(&entered, &exited);
        rec.spin_until_cancelled = true;
        let task = ManagedTask::new(TaskConfig::default(), rec).expect("new");

        assert_eq!(task.join().expect_err("join before run"), IpcError::NotRunning);
        assert_eq!(
            task.cancel().expect_err("cancel before run"),
            IpcError::NotRunning
        );

        task.run().expect("run");
        assert_eq!(task.run().expect_err("second run"), IpcError::AlreadyRunning);

        task.cancel().expect("cancel");
        assert_eq!(task.join().expect_err("join after cancel"), IpcError::NotRunning);
        assert_eq!(
            task.cancel().expect_err("second cancel"),
            IpcError::NotRunning
        );
    }

    #[test]
    fn realtime_policy_requires_a_realtime_priority() {
        struct Noop;
        impl TaskBody for Noop {
            fn run(&mut self, _cancel: &CancelToken) -> i32 {
                0
            }
        }

        let cfg = TaskConfig {
            policy: SchedPolicy::Fifo,
            priority: 0,
            ..TaskConfig::default()
        };
        assert_eq!(
            ManagedTask::new(cfg, Noop).err(),
            Some(IpcError::UnsupportedMode)
        );

        let cfg = TaskConfig {
            policy: SchedPolicy::Other,
            priority: 7,
            ..TaskConfig::default()
        };
        assert_eq!(
            ManagedTask::new(cfg, Noop).err(),
            Some(IpcError::UnsupportedMode)
        );
    }

    #[test]
    fn bodies_may_report_distinct_results() {
        struct Coded(Arc<AtomicI32>);
        impl TaskBody for Coded {
            fn run(&mut self, _cancel: &CancelToken) -> i32 {
                self.0.load(Ordering::SeqCst)
            }
        }

        let code = Arc::new(AtomicI32::new(7));
        let task = ManagedTask::new(TaskConfig::default(), Coded(Arc::clone(&code))).expect("new");
        task.run().expect("run");
        assert_eq!(task.join().expect("join"), 7);
    }
}
