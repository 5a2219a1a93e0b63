use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Token(u64);

type Callback = Box<dyn FnOnce() + Send>;
type WakeupFn = Box<dyn Fn() + Send + Sync>;

/// An explicit main-thread dispatch queue. Worker-side code schedules idle
/// callbacks and timeouts from any thread; the host is told through the
/// wakeup function that a flush is due and calls `flush_idle_events` from
/// its main thread, which is the only place callbacks ever run.
///
/// A helper thread watches the timeout deadlines so the wakeup fires even
/// when nothing else is happening.
pub struct MainThread {
    shared: Arc<Shared>,
    timer: Option<thread::JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
    wakeup: WakeupFn,
}

struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
    /// True while a wakeup has been delivered and not yet consumed by a
    /// flush. Gates the wakeup so the host sees one announcement per batch.
    announce_pending: bool,
    quit: bool,
}

struct Entry {
    id: u64,
    due: Option<Instant>,
    callback: Callback,
}

impl MainThread {
    pub fn new(wakeup: WakeupFn) -> Arc<MainThread> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: Vec::new(),
                announce_pending: false,
                quit: false,
            }),
            cond: Condvar::new(),
            wakeup,
        });

        let timer_shared = shared.clone();
        let timer = thread::Builder::new()
            .name("MainThreadTimer".to_owned())
            .spawn(move || timer_thread(&timer_shared))
            .expect("Error creating main thread timer");

        Arc::new(MainThread {
            shared,
            timer: Some(timer),
        })
    }

    /// Queues a callback to run on the next flush.
    pub fn queue_idle<F: FnOnce() + Send + 'static>(&self, callback: F) -> Token {
        self.queue(None, Box::new(callback))
    }

    /// Queues a callback to run on the first flush at or after `deadline`.
    pub fn queue_timeout<F: FnOnce() + Send + 'static>(
        &self,
        delay: std::time::Duration,
        callback: F,
    ) -> Token {
        self.queue(Some(Instant::now() + delay), Box::new(callback))
    }

    fn queue(&self, due: Option<Instant>, callback: Callback) -> Token {
        let (token, announce) = {
            let mut inner = self.shared.inner.lock().expect("Main thread lock poisoned");

            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push(Entry { id, due, callback });

            let announce = due.is_none() && !inner.announce_pending;
            if announce {
                inner.announce_pending = true;
            }

            self.shared.cond.notify_all();

            (Token(id), announce)
        };

        if announce {
            (self.shared.wakeup)();
        }

        token
    }

    /// Drops a queued callback. A callback already running cannot be
    /// cancelled, but one still waiting never runs after this returns.
    pub fn cancel(&self, token: Token) {
        let mut inner = self.shared.inner.lock().expect("Main thread lock poisoned");

        inner.entries.retain(|entry| entry.id != token.0);
        self.shared.cond.notify_all();
    }

    /// Runs every callback that was due when the flush started, in queue
    /// order. Callbacks queued from inside a callback wait for the next
    /// flush.
    pub fn flush_idle_events(&self) {
        let now = Instant::now();

        let due_ids: Vec<u64> = {
            let mut inner = self.shared.inner.lock().expect("Main thread lock poisoned");

            inner.announce_pending = false;

            inner
                .entries
                .iter()
                .filter(|entry| match entry.due {
                    Some(due) => due <= now,
                    None => true,
                })
                .map(|entry| entry.id)
                .collect()
        };

        for id in due_ids {
            let callback = {
                let mut inner = self.shared.inner.lock().expect("Main thread lock poisoned");

                inner
                    .entries
                    .iter()
                    .position(|entry| entry.id == id)
                    .map(|index| inner.entries.remove(index).callback)
            };

            // The entry may have been cancelled by an earlier callback.
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

impl Drop for MainThread {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.inner.lock().expect("Main thread lock poisoned");
            inner.quit = true;
            self.shared.cond.notify_all();
        }

        if let Some(timer) = self.timer.take() {
            timer.join().expect("Error joining main thread timer");
        }
    }
}

fn timer_thread(shared: &Shared) {
    let mut inner = shared.inner.lock().expect("Main thread lock poisoned");

    loop {
        if inner.quit {
            break;
        }

        let next_deadline = inner
            .entries
            .iter()
            .filter_map(|entry| entry.due)
            .min();

        if inner.announce_pending {
            // The host already owes us a flush; nothing to time until then.
            inner = shared.cond.wait(inner).expect("Main thread lock poisoned");
            continue;
        }

        match next_deadline {
            None => {
                inner = shared.cond.wait(inner).expect("Main thread lock poisoned");
            }
            Some(deadline) => {
                let now = Instant::now();

                if deadline <= now {
                    inner.announce_pending = true;
                    drop(inner);

                    (shared.wakeup)();

                    inner = shared.inner.lock().expect("Main thread lock poisoned");
                } else {
                    let (guard, _) = shared
                        .cond
                        .wait_timeout(inner, deadline - now)
                        .expect("Main thread lock poisoned");
                    inner = guard;
                }
            }
        }
    }
}
