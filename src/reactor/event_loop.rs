use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::error::{CarrierError, Result};
use crate::poller::{Event, Poller};

/// Unit of deferred work run by the reactor.
pub type Task = Box<dyn FnOnce() -> Result<()>>;

/// Something registered with the reactor for readability.
pub(crate) trait Source {
    fn on_readable(self: Rc<Self>) -> Result<()>;

    /// The reactor is shutting down.
    fn on_stop(&self);
}

struct Timer {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // reversed: BinaryHeap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

pub(crate) struct Core {
    poller: RefCell<Poller>,
    sources: RefCell<HashMap<usize, Weak<dyn Source>>>,
    ready: RefCell<VecDeque<Task>>,
    timers: RefCell<BinaryHeap<Timer>>,
    next_key: Cell<usize>,
    next_seq: Cell<u64>,
    /// Set by `stop()`, consumed when a run loop returns.
    stopping: Cell<bool>,
}

impl Core {
    pub fn call_soon(&self, task: Task) {
        self.ready.borrow_mut().push_back(task);
    }

    pub fn register(&self, fd: RawFd, source: Weak<dyn Source>) -> io::Result<usize> {
        let key = self.next_key.get();
        self.poller.borrow().add(fd, key)?;
        self.next_key.set(key + 1);
        self.sources.borrow_mut().insert(key, source);
        Ok(key)
    }

    pub fn deregister(&self, key: usize, fd: RawFd) {
        self.sources.borrow_mut().remove(&key);
        if let Err(e) = self.poller.borrow().delete(fd) {
            log::debug!("deregister: fd={}: {}", fd, e);
        }
    }

    /// Runs the tasks queued before this call. Tasks they queue wait for the
    /// next tick.
    fn run_ready(&self) -> Result<usize> {
        let mut batch = std::mem::take(&mut *self.ready.borrow_mut());
        let count = batch.len();
        while let Some(task) = batch.pop_front() {
            if let Err(e) = task() {
                self.requeue(batch);
                return Err(e);
            }
        }
        Ok(count)
    }

    fn run_timers(&self) -> Result<usize> {
        let now = Instant::now();
        let mut due = VecDeque::new();
        {
            let mut timers = self.timers.borrow_mut();
            while timers.peek().map_or(false, |t| t.deadline <= now) {
                if let Some(timer) = timers.pop() {
                    due.push_back(timer.task);
                }
            }
        }

        let count = due.len();
        while let Some(task) = due.pop_front() {
            if let Err(e) = task() {
                self.requeue(due);
                return Err(e);
            }
        }
        Ok(count)
    }

    /// Puts unrun tasks back in front of whatever was queued meanwhile.
    fn requeue(&self, mut tasks: VecDeque<Task>) {
        let mut ready = self.ready.borrow_mut();
        while let Some(task) = tasks.pop_back() {
            ready.push_front(task);
        }
    }

    fn next_wait(&self, max_wait: Option<Duration>) -> Option<Duration> {
        if self.stopping.get() || !self.ready.borrow().is_empty() {
            return Some(Duration::from_secs(0));
        }
        let until_timer = self
            .timers
            .borrow()
            .peek()
            .map(|t| t.deadline.saturating_duration_since(Instant::now()));
        match (max_wait, until_timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Single-threaded event loop for [`ReactorTransport`](super::ReactorTransport)s.
///
/// Each tick runs the tasks that were queued before it, then the expired
/// timers, then waits for socket readiness and lets every readable socket
/// schedule its deliveries for the following tick.
pub struct Reactor {
    core: Rc<Core>,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Ok(Reactor {
            core: Rc::new(Core {
                poller: RefCell::new(Poller::new()?),
                sources: RefCell::new(HashMap::new()),
                ready: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BinaryHeap::new()),
                next_key: Cell::new(1),
                next_seq: Cell::new(0),
                stopping: Cell::new(false),
            }),
        })
    }

    pub(crate) fn core(&self) -> Rc<Core> {
        self.core.clone()
    }

    /// Runs `task` on the next tick.
    pub fn call_soon<F>(&self, task: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.core.call_soon(Box::new(task));
    }

    /// Runs `task` on the first tick after `delay` has passed.
    pub fn call_later<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        let seq = self.core.next_seq.get();
        self.core.next_seq.set(seq + 1);
        self.core.timers.borrow_mut().push(Timer {
            deadline: Instant::now() + delay,
            seq,
            task: Box::new(task),
        });
    }

    /// Tasks waiting for the next tick.
    pub fn pending_tasks(&self) -> usize {
        self.core.ready.borrow().len()
    }

    /// Registered sockets.
    pub fn source_count(&self) -> usize {
        self.core.sources.borrow().len()
    }

    /// Runs one tick, waiting at most `max_wait` for readiness (forever if
    /// `None` and nothing else is scheduled). Returns how many tasks, timers
    /// and socket events were handled.
    pub fn run_once(&self, max_wait: Option<Duration>) -> Result<usize> {
        let mut handled = self.core.run_ready()?;
        handled += self.core.run_timers()?;

        let wait = self.core.next_wait(max_wait);
        let mut events: Vec<Event> = Vec::new();
        self.core
            .poller
            .borrow_mut()
            .wait(&mut events, wait)
            .map_err(|source| CarrierError::Poll {
                operation: "reactor",
                source,
            })?;

        for ev in events {
            let source = self.core.sources.borrow().get(&ev.key).and_then(Weak::upgrade);
            if let Some(source) = source {
                source.on_readable()?;
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Keeps ticking until `duration` has passed or [`Reactor::stop`] is
    /// called.
    pub fn run_for(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline || self.core.stopping.replace(false) {
                return Ok(());
            }
            self.run_once(Some(deadline - now))?;
        }
    }

    /// Keeps ticking until [`Reactor::stop`] is called. A stop requested
    /// before this call makes it return at once.
    pub fn run(&self) -> Result<()> {
        while !self.core.stopping.replace(false) {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Ends the current or next run loop and sends the stop signal to every
    /// registered transport. Ticks do not wait for readiness until the run
    /// loop has returned.
    pub fn stop(&self) {
        self.core.stopping.set(true);
        let sources: Vec<Rc<dyn Source>> = self
            .core
            .sources
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        log::debug!("stop: stopping {} sources", sources.len());
        for source in sources {
            source.on_stop();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // queued tasks hold transports, which hold the core
        let tasks = std::mem::take(&mut *self.core.ready.borrow_mut());
        let timers = std::mem::take(&mut *self.core.timers.borrow_mut());
        drop(tasks);
        drop(timers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_queued_by_tasks_run_next_tick() {
        let reactor = Reactor::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let core = reactor.core();
        let l = log.clone();
        reactor.call_soon(move || {
            l.borrow_mut().push("first");
            let l2 = l.clone();
            core.call_soon(Box::new(move || {
                l2.borrow_mut().push("nested");
                Ok(())
            }));
            Ok(())
        });

        reactor.run_once(Some(Duration::from_secs(0))).unwrap();
        assert_eq!(*log.borrow(), vec!["first"]);
        assert_eq!(reactor.pending_tasks(), 1);

        reactor.run_once(Some(Duration::from_secs(0))).unwrap();
        assert_eq!(*log.borrow(), vec!["first", "nested"]);
        assert_eq!(reactor.pending_tasks(), 0);
    }

    #[test]
    fn failed_task_keeps_the_rest_queued() {
        let reactor = Reactor::new().unwrap();
        let ran = Rc::new(Cell::new(0));

        reactor.call_soon(|| {
            Err(CarrierError::NotOpen {
                operation: "test",
            })
        });
        let r = ran.clone();
        reactor.call_soon(move || {
            r.set(r.get() + 1);
            Ok(())
        });

        assert!(reactor.run_once(Some(Duration::from_secs(0))).is_err());
        assert_eq!(ran.get(), 0);
        assert_eq!(reactor.pending_tasks(), 1);

        reactor.run_once(Some(Duration::from_secs(0))).unwrap();
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let reactor = Reactor::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        for (delay, name) in [(30u64, "late"), (10, "early"), (10, "early-second")] {
            let l = log.clone();
            reactor.call_later(Duration::from_millis(delay), move || {
                l.borrow_mut().push(name);
                Ok(())
            });
        }

        reactor.run_for(Duration::from_millis(80)).unwrap();
        assert_eq!(*log.borrow(), vec!["early", "early-second", "late"]);
    }

    #[test]
    fn stop_ends_run() {
        let reactor = Rc::new(Reactor::new().unwrap());
        let r = Rc::downgrade(&reactor);
        reactor.call_later(Duration::from_millis(5), move || {
            if let Some(reactor) = r.upgrade() {
                reactor.stop();
            }
            Ok(())
        });
        reactor.run().unwrap();
    }

    #[test]
    fn stop_before_run_is_kept() {
        let reactor = Reactor::new().unwrap();
        reactor.stop();
        reactor.run().unwrap();

        // consumed by the run that honoured it
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        reactor.call_later(Duration::from_millis(10), move || {
            r.set(true);
            Ok(())
        });
        reactor.run_for(Duration::from_millis(40)).unwrap();
        assert!(ran.get());
    }

    #[test]
    fn stop_from_a_task_ends_run_for_early() {
        let reactor = Rc::new(Reactor::new().unwrap());
        let r = Rc::downgrade(&reactor);
        reactor.call_soon(move || {
            if let Some(reactor) = r.upgrade() {
                reactor.stop();
            }
            Ok(())
        });

        let started = Instant::now();
        reactor.run_for(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
