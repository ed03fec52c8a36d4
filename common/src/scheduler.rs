use std::{
    io,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

/// Deferred work executed on the scheduler thread with exclusive access to `C`.
pub type Task<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeFlag {
    NetworkError,
    AudioSendReady,
    WakeWordDetected,
    VoiceActivityChanged,
    WorkPending,
    ClockTick,
}

impl WakeFlag {
    /// Service order, highest priority first.
    pub const PRIORITY: [WakeFlag; 6] = [
        WakeFlag::NetworkError,
        WakeFlag::AudioSendReady,
        WakeFlag::WakeWordDetected,
        WakeFlag::VoiceActivityChanged,
        WakeFlag::WorkPending,
        WakeFlag::ClockTick,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Wake reasons collected by one call to [`Scheduler::wait`].
#[derive(Debug, Default)]
pub struct Pending {
    bits: u8,
    network_error: Option<String>,
}

impl Pending {
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn contains(&self, flag: WakeFlag) -> bool {
        self.bits & flag.bit() != 0
    }

    /// Raised flags in service order.
    pub fn flags(&self) -> impl Iterator<Item = WakeFlag> + '_ {
        WakeFlag::PRIORITY
            .into_iter()
            .filter(move |flag| self.contains(*flag))
    }

    pub fn take_network_error(&mut self) -> Option<String> {
        self.network_error.take()
    }
}

struct Shared<C> {
    tasks: Mutex<Vec<Task<C>>>,
    pending: Mutex<Pending>,
    wake: Condvar,
    owner: Mutex<Option<ThreadId>>,
}

/// Callback queue plus level-triggered wake flags feeding a single consumer thread.
///
/// Cloning is cheap; every clone feeds the same consumer.
pub struct Scheduler<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: 'static> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(Vec::new()),
                pending: Mutex::new(Pending::default()),
                wake: Condvar::new(),
                owner: Mutex::new(None),
            }),
        }
    }

    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        lock(&self.shared.tasks).push(Box::new(task));
        self.raise(WakeFlag::WorkPending);
    }

    pub fn raise(&self, flag: WakeFlag) {
        lock(&self.shared.pending).bits |= flag.bit();
        self.shared.wake.notify_all();
    }

    /// Raises [`WakeFlag::NetworkError`]; an unserviced earlier message is replaced.
    pub fn raise_network_error(&self, message: impl Into<String>) {
        {
            let mut pending = lock(&self.shared.pending);
            pending.network_error = Some(message.into());
            pending.bits |= WakeFlag::NetworkError.bit();
        }
        self.shared.wake.notify_all();
    }

    /// Blocks until at least one flag is raised or `timeout` elapses, then
    /// clears and returns everything raised so far.
    pub fn wait(&self, timeout: Option<Duration>) -> Pending {
        let mut pending = lock(&self.shared.pending);
        match timeout {
            None => {
                while pending.is_empty() {
                    pending = self
                        .shared
                        .wake
                        .wait(pending)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while pending.is_empty() {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self
                        .shared
                        .wake
                        .wait_timeout(pending, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    pending = guard;
                }
            }
        }
        std::mem::take(&mut *pending)
    }

    /// Swaps the queue out so callbacks run without holding the queue lock.
    pub fn take_tasks(&self) -> Vec<Task<C>> {
        std::mem::take(&mut *lock(&self.shared.tasks))
    }

    pub fn bind_current_thread(&self) {
        *lock(&self.shared.owner) = Some(thread::current().id());
    }

    pub fn is_scheduler_thread(&self) -> bool {
        *lock(&self.shared.owner) == Some(thread::current().id())
    }

    /// Raises [`WakeFlag::ClockTick`] every `period` until the scheduler is dropped.
    pub fn spawn_clock(&self, period: Duration) -> io::Result<JoinHandle<()>> {
        let shared = Arc::downgrade(&self.shared);
        thread::Builder::new()
            .name("clock-tick".into())
            .stack_size(4 * 1024)
            .spawn(move || loop {
                thread::sleep(period);
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                Scheduler { shared }.raise(WakeFlag::ClockTick);
            })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    type Log = Vec<String>;

    fn drain(scheduler: &Scheduler<Log>, log: &mut Log) {
        for task in scheduler.take_tasks() {
            task(log);
        }
    }

    #[test]
    fn flags_come_back_in_priority_order() {
        let scheduler = Scheduler::<Log>::new();
        scheduler.raise(WakeFlag::ClockTick);
        scheduler.schedule(|_| {});
        scheduler.raise(WakeFlag::WakeWordDetected);
        scheduler.raise_network_error("socket closed");

        let mut pending = scheduler.wait(Some(Duration::ZERO));
        let flags: Vec<_> = pending.flags().collect();

        assert_eq!(
            flags,
            vec![
                WakeFlag::NetworkError,
                WakeFlag::WakeWordDetected,
                WakeFlag::WorkPending,
                WakeFlag::ClockTick,
            ]
        );
        assert_eq!(pending.take_network_error().as_deref(), Some("socket closed"));
        assert!(scheduler.wait(Some(Duration::ZERO)).is_empty());
    }

    #[test]
    fn callbacks_run_in_enqueue_order() {
        let scheduler = Scheduler::<Log>::new();
        for name in ["first", "second", "third"] {
            scheduler.schedule(move |log: &mut Log| log.push(name.to_string()));
        }

        let mut log = Log::new();
        drain(&scheduler, &mut log);

        assert_eq!(log, vec!["first", "second", "third"]);
    }

    #[test]
    fn work_scheduled_during_a_drain_waits_for_the_next_wake() {
        let scheduler = Scheduler::<Log>::new();
        let inner = scheduler.clone();
        scheduler.schedule(move |log: &mut Log| {
            log.push("outer".to_string());
            inner.schedule(|log: &mut Log| log.push("inner".to_string()));
        });

        let pending = scheduler.wait(Some(Duration::ZERO));
        assert!(pending.contains(WakeFlag::WorkPending));
        let mut log = Log::new();
        drain(&scheduler, &mut log);
        assert_eq!(log, vec!["outer"]);

        let pending = scheduler.wait(Some(Duration::ZERO));
        assert!(pending.contains(WakeFlag::WorkPending));
        drain(&scheduler, &mut log);
        assert_eq!(log, vec!["outer", "inner"]);
    }

    #[test]
    fn latest_network_error_message_wins() {
        let scheduler = Scheduler::<Log>::new();
        scheduler.raise_network_error("first");
        scheduler.raise_network_error("second");

        let mut pending = scheduler.wait(Some(Duration::ZERO));
        assert_eq!(pending.take_network_error().as_deref(), Some("second"));
    }

    #[test]
    fn wait_times_out_without_flags() {
        let scheduler = Scheduler::<Log>::new();
        let started = Instant::now();
        let pending = scheduler.wait(Some(Duration::from_millis(20)));
        assert!(pending.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn raise_from_another_thread_wakes_the_consumer() {
        let scheduler = Scheduler::<Log>::new();
        let producer = scheduler.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.raise(WakeFlag::AudioSendReady);
        });

        let pending = scheduler.wait(None);
        handle.join().unwrap();
        assert!(pending.contains(WakeFlag::AudioSendReady));
    }

    #[test]
    fn scheduler_thread_is_the_bound_one() {
        let scheduler = Scheduler::<Log>::new();
        assert!(!scheduler.is_scheduler_thread());
        scheduler.bind_current_thread();
        assert!(scheduler.is_scheduler_thread());

        let other = scheduler.clone();
        let seen = thread::spawn(move || other.is_scheduler_thread())
            .join()
            .unwrap();
        assert!(!seen);
    }
}
