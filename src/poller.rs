use std::convert::TryInto;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

/// Calls a libc function and results in `io::Result`.
#[cfg(unix)]
macro_rules! syscall {
    ($fn:ident $args:tt) => {{
        let res = unsafe { libc::$fn $args };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

const MAX_EVENTS: usize = 256;

/// Level-triggered readability interface to epoll.
///
/// Every registered descriptor stays armed until it is deleted, so a socket
/// that still holds unread datagrams is reported again on the next wait.
pub struct Poller {
    /// File descriptor for the epoll instance.
    epoll_fd: RawFd,
    /// Events buffer
    events: Events,
}

impl Poller {
    /// Creates a new poller.
    pub fn new() -> io::Result<Poller> {
        let epoll_fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        log::trace!("new: epoll_fd={}", epoll_fd);
        Ok(Poller {
            epoll_fd,
            events: Events::new(),
        })
    }

    /// Starts watching `fd` for readability, reporting it under `key`.
    pub fn add(&self, fd: RawFd, key: usize) -> io::Result<()> {
        log::trace!("add: epoll_fd={}, fd={}, key={}", self.epoll_fd, fd, key);
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(key))
    }

    /// Stops watching `fd`.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        log::trace!("delete: epoll_fd={}, fd={}", self.epoll_fd, fd);
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    /// Waits for I/O events with an optional timeout.
    ///
    /// Returns the number of events appended to `events`. An interrupted wait
    /// reports zero events instead of failing.
    pub fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        match self.wait_events(timeout) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.events.len = 0;
            }
            res => res?,
        }

        let len = events.len();
        events.extend(self.events.iter());
        Ok(events.len() - len)
    }

    fn wait_events(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        log::trace!("wait: epoll_fd={}, timeout={:?}", self.epoll_fd, timeout);

        let res = syscall!(epoll_wait(
            self.epoll_fd,
            self.events.list.as_mut_ptr(),
            self.events.list.len() as libc::c_int,
            timeout_millis(timeout),
        ))?;
        self.events.len = res as usize;
        log::trace!("new events: epoll_fd={}, res={}", self.epoll_fd, res);

        Ok(())
    }

    /// Passes arguments to `epoll_ctl`.
    fn ctl(&self, op: libc::c_int, fd: RawFd, key: Option<usize>) -> io::Result<()> {
        let mut ev = key.map(|key| libc::epoll_event {
            events: read_flags() as _,
            u64: key as u64,
        });
        syscall!(epoll_ctl(
            self.epoll_fd,
            op,
            fd,
            ev.as_mut()
                .map(|ev| ev as *mut libc::epoll_event)
                .unwrap_or(ptr::null_mut()),
        ))?;
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        log::trace!("drop: epoll_fd={}", self.epoll_fd);

        let _ = syscall!(close(self.epoll_fd));
    }
}

/// Timeout in milliseconds for epoll, `-1` meaning forever.
fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(t) if t == Duration::from_secs(0) => 0,
        Some(t) => {
            // Round up to a whole millisecond.
            let mut ms: libc::c_int = t.as_millis().try_into().unwrap_or(libc::c_int::MAX);
            if Duration::from_millis(ms as u64) < t {
                ms = ms.saturating_add(1);
            }
            ms
        }
        None => -1,
    }
}

/// Epoll flags for all possible readability events.
fn read_flags() -> libc::c_int {
    libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLPRI
}

/// A list of reported I/O events.
struct Events {
    list: Box<[libc::epoll_event]>,
    len: usize,
}

unsafe impl Send for Events {}

impl Events {
    fn new() -> Events {
        let ev = libc::epoll_event { events: 0, u64: 0 };
        Events {
            list: vec![ev; MAX_EVENTS].into_boxed_slice(),
            len: 0,
        }
    }

    fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.list[..self.len].iter().map(|ev| {
            let flags = ev.events as libc::c_int;
            Event {
                key: ev.u64 as usize,
                readable: flags & libc::EPOLLIN != 0,
                error: flags & (libc::EPOLLERR | libc::EPOLLHUP) != 0,
            }
        })
    }
}

/// Indicates that a socket has something to hand out without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Key the descriptor was registered under.
    pub key: usize,
    /// A datagram is waiting.
    pub readable: bool,
    /// A pending socket error is waiting; the next read reports it.
    pub error: bool,
}
