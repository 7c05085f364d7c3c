use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use ember_http::{Deadline, Reactor};

fn new_reactor() -> Rc<Reactor> {
    Reactor::new(Duration::from_secs(3600), 1000).unwrap()
}

#[test]
fn timers_fire_in_deadline_then_insertion_order() {
    let reactor = new_reactor();
    let order = Rc::new(RefCell::new(Vec::new()));
    let now = Instant::now();

    for (name, offset_ms) in [("t1", 10u64), ("t2", 10), ("t3", 5)] {
        let order = order.clone();
        reactor.add_timeout(Deadline::At(now + Duration::from_millis(offset_ms)), move || {
            order.borrow_mut().push(name);
            Ok(())
        });
    }

    let stopper = reactor.clone();
    reactor.add_timeout(Deadline::At(now + Duration::from_millis(50)), move || {
        stopper.stop();
        Ok(())
    });

    reactor.start().unwrap();

    assert_eq!(*order.borrow(), vec!["t3", "t1", "t2"]);
}

#[test]
fn cancelled_timeout_does_not_fire() {
    let reactor = new_reactor();
    let fired = Rc::new(RefCell::new(false));

    let flag = fired.clone();
    let handle = reactor.add_timeout(Duration::from_millis(5), move || {
        *flag.borrow_mut() = true;
        Ok(())
    });
    reactor.remove_timeout(&handle);

    let stopper = reactor.clone();
    reactor.add_timeout(Duration::from_millis(30), move || {
        stopper.stop();
        Ok(())
    });

    reactor.start().unwrap();

    assert!(!*fired.borrow());
}

#[test]
fn deferred_callbacks_run_in_insertion_order() {
    let reactor = new_reactor();
    let order = Rc::new(RefCell::new(Vec::new()));

    for i in 0..3u32 {
        let order = order.clone();
        reactor.add_callback(move || {
            order.borrow_mut().push(i);
            Ok(())
        });
    }

    let stopper = reactor.clone();
    reactor.add_callback(move || {
        stopper.stop();
        Ok(())
    });

    reactor.start().unwrap();

    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[test]
fn callback_failure_does_not_abort_the_loop() {
    let reactor = new_reactor();
    let ran_after = Rc::new(RefCell::new(false));

    reactor.add_callback(|| Err(ember_http::Error::Internal("deliberate")));

    let flag = ran_after.clone();
    let stopper = reactor.clone();
    reactor.add_callback(move || {
        *flag.borrow_mut() = true;
        stopper.stop();
        Ok(())
    });

    reactor.start().unwrap();

    assert!(*ran_after.borrow());
}

#[test]
fn remote_callback_wakes_a_blocked_reactor() {
    let reactor = new_reactor();
    let remote = reactor.remote();
    let (tx, rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let tx = tx.clone();
        remote.add_callback(move || {
            tx.send("from off-thread").unwrap();
            Ok(())
        });
        remote.stop();
    });

    let started = Instant::now();
    reactor.start().unwrap();
    worker.join().unwrap();

    // The reactor was parked on a one-hour poll; only the waker can
    // explain returning this quickly.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(rx.try_recv().unwrap(), "from off-thread");
}

#[test]
fn timer_scheduled_callback_runs_before_next_wait() {
    let reactor = new_reactor();
    let order = Rc::new(RefCell::new(Vec::new()));

    let inner = reactor.clone();
    let order_timer = order.clone();
    reactor.add_timeout(Duration::from_millis(5), move || {
        order_timer.borrow_mut().push("timer");

        let order = order_timer.clone();
        let stopper = inner.clone();
        inner.add_callback(move || {
            order.borrow_mut().push("callback");
            stopper.stop();
            Ok(())
        });
        Ok(())
    });

    let started = Instant::now();
    reactor.start().unwrap();

    // The callback enqueued by the timer must not wait out the one-hour
    // poll timeout.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(*order.borrow(), vec!["timer", "callback"]);
}

#[test]
fn stop_then_start_returns_immediately() {
    let reactor = new_reactor();

    reactor.stop();
    let started = Instant::now();
    reactor.start().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    reactor.close().unwrap();
}
