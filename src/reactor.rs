use std::cell::RefCell;
use std::cmp;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::{error, trace, warn};

use crate::error::{Error, Result};
use crate::queue::{Remote, Shared};
use crate::ready::Ready;
use crate::sys;
use crate::timer::{Deadline, TimeoutHandle, TimerCallback, TimerHeap, TimerStep};
use crate::waker::Waker;

pub type IoHandler = Rc<dyn Fn(RawFd, Ready) -> Result<()>>;
pub type Callback = Box<dyn FnOnce() -> Result<()>>;

const EVENTS_CAPACITY: usize = 1024;

/// A level-triggered, single-threaded event reactor.
///
/// One thread owns the reactor and everything registered with it: the
/// descriptor handler table, the timer heap and the deferred callback
/// queue. The only operation another thread may perform is enqueueing a
/// callback through the [`Remote`] handle; the reactor is `!Send` and
/// `!Sync`, so the compiler enforces the rest.
///
/// Handlers, timer callbacks and deferred callbacks all return
/// [`Result`]; failures are logged at the loop boundary and never abort
/// the loop. Errors from the poller itself (other than `EINTR`, which is
/// retried) propagate out of [`start`].
///
/// [`start`]: Reactor::start
pub struct Reactor {
    epoll: sys::Epoll,
    waker: Waker,
    handlers: RefCell<IndexMap<RawFd, IoHandler>>,
    pending: RefCell<IndexMap<RawFd, Ready>>,
    timers: RefCell<TimerHeap>,
    local: RefCell<VecDeque<Callback>>,
    shared: Arc<Shared>,
    events: RefCell<sys::Events>,
    poll_timeout: Duration,
    poll_threshold: usize,
}

impl Reactor {
    pub fn new(poll_timeout: Duration, poll_threshold: usize) -> Result<Rc<Reactor>> {
        let epoll = sys::Epoll::new()?;
        let waker = Waker::new()?;
        let shared = Arc::new(Shared::new(waker.clone()));

        let reactor = Rc::new(Reactor {
            epoll,
            waker: waker.clone(),
            handlers: RefCell::new(IndexMap::new()),
            pending: RefCell::new(IndexMap::new()),
            timers: RefCell::new(TimerHeap::new()),
            local: RefCell::new(VecDeque::new()),
            shared,
            events: RefCell::new(sys::Events::with_capacity(EVENTS_CAPACITY)),
            poll_timeout,
            poll_threshold,
        });

        trace!("adding poll-loop waker");
        let fd = waker.as_raw_fd();
        reactor.add_handler(fd, Ready::readable(), move |_, _| {
            waker.drain()?;
            Ok(())
        })?;

        Ok(reactor)
    }

    /// Registers `handler` to receive readiness events for `fd`.
    ///
    /// The descriptor is watched for `interest` plus error readiness.
    /// Fails with [`Error::HandlerExists`] if `fd` is already registered.
    pub fn add_handler<F>(&self, fd: RawFd, interest: Ready, handler: F) -> Result<()>
    where
        F: Fn(RawFd, Ready) -> Result<()> + 'static,
    {
        let mut handlers = self.handlers.borrow_mut();

        if handlers.contains_key(&fd) {
            return Err(Error::HandlerExists(fd));
        }

        self.epoll.add(fd, interest | Ready::error())?;
        handlers.insert(fd, Rc::new(handler));

        if handlers.len() > self.poll_threshold {
            warn!(
                "polled descriptors ({}) exceeded threshold {}",
                handlers.len(),
                self.poll_threshold
            );
        }

        trace!("added descriptor {} to epoll", fd);
        Ok(())
    }

    /// Changes the events we listen for on `fd`.
    pub fn update_handler(&self, fd: RawFd, interest: Ready) -> Result<()> {
        self.epoll.modify(fd, interest | Ready::error())?;
        trace!("updated descriptor {} to {:?}", fd, interest);
        Ok(())
    }

    /// Stops listening for events on `fd` and drops any event already
    /// collected for it. Quiet when `fd` was not registered, so teardown
    /// paths may call it unconditionally.
    pub fn remove_handler(&self, fd: RawFd) {
        self.handlers.borrow_mut().swap_remove(&fd);
        self.pending.borrow_mut().swap_remove(&fd);

        if let Err(err) = self.epoll.delete(fd) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("error deleting fd {} from epoll: {}", fd, err);
            }
        }

        trace!("removed descriptor {} from epoll", fd);
    }

    /// Calls `callback` once `deadline` is reached. The returned handle
    /// cancels it; a cancelled entry stays in the heap until it surfaces.
    pub fn add_timeout<D, F>(&self, deadline: D, callback: F) -> TimeoutHandle
    where
        D: Into<Deadline>,
        F: FnOnce() -> Result<()> + 'static,
    {
        let callback: TimerCallback = Box::new(callback);
        self.timers.borrow_mut().add(deadline.into(), callback)
    }

    /// Cancels a pending timeout.
    pub fn remove_timeout(&self, handle: &TimeoutHandle) {
        handle.cancel();
    }

    /// Runs `callback` at the start of the next loop iteration.
    ///
    /// Reactor-thread only; use [`Reactor::remote`] to enqueue work from
    /// other threads.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.local.borrow_mut().push_back(Box::new(callback));
    }

    /// A cloneable, `Send` handle for cross-thread callback submission
    /// and shutdown.
    pub fn remote(&self) -> Remote {
        Remote::new(self.shared.clone())
    }

    /// Starts the loop; blocks until [`stop`] is observed.
    ///
    /// If `stop` was called before `start`, the stop flag is cleared and
    /// this returns immediately, so a start/stop pair is always balanced.
    ///
    /// [`stop`]: Reactor::stop
    pub fn start(&self) -> Result<()> {
        if self.shared.is_stopped() {
            self.shared.set_stopped(false);
            return Ok(());
        }

        self.shared.set_running(true);

        loop {
            // Run deferred callbacks. Anything they enqueue is delayed to
            // the next iteration so socket events cannot be starved.
            let callbacks: Vec<Callback> = self.local.borrow_mut().drain(..).collect();
            for callback in callbacks {
                if let Err(err) = callback() {
                    error!("error in deferred callback: {}", err);
                }
            }
            for callback in self.shared.drain() {
                if let Err(err) = callback() {
                    error!("error in deferred callback: {}", err);
                }
            }

            // Timers: discard cancelled entries, run everything due, and
            // clamp the poll timeout to the next live deadline.
            let mut poll_timeout = self.poll_timeout;
            let now = Instant::now();
            loop {
                let step = self.timers.borrow_mut().step(now);
                match step {
                    TimerStep::Run(callback) => {
                        if let Err(err) = callback() {
                            error!("error in timeout callback: {}", err);
                        }
                    }
                    TimerStep::WaitUntil(at) => {
                        poll_timeout = cmp::min(poll_timeout, at.saturating_duration_since(now));
                        break;
                    }
                    TimerStep::Idle => break,
                }
            }

            // A timer may have enqueued more work; don't sleep on it.
            if !self.local.borrow().is_empty() || self.shared.has_pending() {
                poll_timeout = Duration::from_millis(0);
            }

            if !self.shared.is_running() {
                break;
            }

            {
                let mut events = self.events.borrow_mut();
                match self.epoll.wait(&mut events, Some(poll_timeout)) {
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }

            // Merge the freshly returned events into the pending map, then
            // drain it one entry at a time. Handlers may register or
            // remove other descriptors while we do, so the table is
            // re-consulted on every pop.
            {
                let events = self.events.borrow();
                let mut pending = self.pending.borrow_mut();
                for i in 0..events.len() {
                    let event = events.get(i).expect("event index out of range");
                    *pending.entry(event.fd).or_insert_with(Ready::empty) |= event.ready;
                }
            }

            loop {
                let entry = self.pending.borrow_mut().pop();
                let Some((fd, ready)) = entry else { break };

                let handler = self.handlers.borrow().get(&fd).cloned();
                if let Some(handler) = handler {
                    if let Err(err) = handler(fd, ready) {
                        error!("error in handler for fd {}: {}", fd, err);
                    }
                }
            }
        }

        // Reset the stopped flag so another start/stop pair can be issued.
        self.shared.set_stopped(false);

        Ok(())
    }

    /// Stops the loop after the current iteration completes. If the loop
    /// is not running, the next call to `start` returns immediately.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Releases the waker registration. The reactor must be stopped; the
    /// poller and waker descriptors themselves close on drop.
    pub fn close(&self) -> Result<()> {
        if self.shared.is_running() {
            return Err(Error::Internal("reactor must be stopped before close"));
        }

        self.remove_handler(self.waker.as_raw_fd());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stop_before_start_returns_immediately() {
        let reactor = Reactor::new(Duration::from_secs(1), 1000).unwrap();

        reactor.stop();
        reactor.start().unwrap();

        // The flag was consumed; a second stop/start pair behaves the same.
        reactor.stop();
        reactor.start().unwrap();
    }

    #[test]
    fn duplicate_handler_is_rejected() {
        let reactor = Reactor::new(Duration::from_secs(1), 1000).unwrap();
        let fd = reactor.waker.as_raw_fd();

        match reactor.add_handler(fd, Ready::readable(), |_, _| Ok(())) {
            Err(Error::HandlerExists(dup)) => assert_eq!(dup, fd),
            other => panic!("expected HandlerExists, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn remove_handler_is_idempotent() {
        let reactor = Reactor::new(Duration::from_secs(1), 1000).unwrap();

        reactor.remove_handler(12345);
        reactor.remove_handler(12345);
    }
}
