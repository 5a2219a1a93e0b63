use crate::net::connection::Connection;
use crate::net::event::EventKind;
use flint::logging;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

const WAKER_TOKEN: Token = Token(0);
const SOCKET_TOKEN: Token = Token(1);

/// Delay before retrying a failed address resolve.
const RESOLVE_RETRY_DELAY: Duration = Duration::from_secs(10);

/// The background thread that drives the connection engine. It owns the one
/// poll operation; the engine is owned inside the worker's mutex and every
/// outside call goes through [`Worker::lock`].
pub struct Worker {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    waker: Waker,
    wake_queued: AtomicBool,
}

struct State {
    connection: Connection,
    /// Pending hostname to resolve, if any. Cleared when the resolve
    /// succeeds; left in place for a delayed retry on failure.
    resolve: Option<(String, u16)>,
    last_resolve_at: Option<Instant>,
    quit: bool,
}

impl Worker {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        connection: Connection,
        log: L,
    ) -> io::Result<Worker> {
        let log = logging::child_or_discard(log);

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                connection,
                resolve: None,
                last_resolve_at: None,
                quit: false,
            }),
            waker,
            wake_queued: AtomicBool::new(false),
        });

        // The engine announces poll-set changes through its event signal;
        // the listener only pokes the waker, so it is safe to run with the
        // worker lock held.
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        shared
            .state
            .lock()
            .expect("Worker lock poisoned")
            .connection
            .event_signal()
            .add(move |event| {
                if let EventKind::PollChanged(_) = event.kind {
                    if let Some(shared) = weak.upgrade() {
                        shared.wake();
                    }
                }
            });

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("ConnectionWorker".to_owned())
            .spawn(move || run(thread_shared, poll, log))?;

        Ok(Worker {
            shared,
            thread: Some(thread),
        })
    }

    /// Acquires the worker lock and returns a guard that dereferences to
    /// the engine. The lock is not recursive; callers must not re-enter.
    pub fn lock(&self) -> WorkerGuard<'_> {
        WorkerGuard {
            state: self.shared.state.lock().expect("Worker lock poisoned"),
        }
    }

    /// Stores an address to resolve on the worker thread. The lookup itself
    /// runs with the lock released; on success the result is applied to the
    /// engine, on failure the query is retried after a delay.
    pub fn queue_address_resolve(&self, host: &str, port: u16) {
        {
            let mut state = self.shared.state.lock().expect("Worker lock poisoned");

            state.resolve = Some((host.to_owned(), port));
            state.last_resolve_at = None;
        }

        self.shared.wake();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("Worker lock poisoned");
            state.quit = true;
        }

        self.shared.wake();

        if let Some(thread) = self.thread.take() {
            thread.join().expect("Error joining worker thread");
        }
    }
}

pub struct WorkerGuard<'a> {
    state: MutexGuard<'a, State>,
}

impl<'a> Deref for WorkerGuard<'a> {
    type Target = Connection;

    #[inline]
    fn deref(&self) -> &Connection {
        &self.state.connection
    }
}

impl<'a> DerefMut for WorkerGuard<'a> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.state.connection
    }
}

impl Shared {
    fn wake(&self) {
        if !self.wake_queued.swap(true, Ordering::SeqCst) {
            drop(self.waker.wake());
        }
    }
}

fn run(shared: Arc<Shared>, mut poll: Poll, log: logging::Logger) {
    let mut events = Events::with_capacity(8);

    // (socket generation, interest) currently registered on the poll
    let mut registered: Option<(u64, Interest)> = None;

    loop {
        let timeout = {
            let mut state = shared.state.lock().expect("Worker lock poisoned");

            if state.quit {
                break;
            }

            sync_registration(&mut state.connection, &poll, &mut registered, &log);
            compute_timeout(&state)
        };

        match poll.poll(&mut events, timeout) {
            Ok(()) => (),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                logging::error!(log, "poll failed"; "context" => "run", "error" => %err);
                break;
            }
        }

        shared.wake_queued.store(false, Ordering::SeqCst);

        let mut readable = false;
        let mut writable = false;

        for event in events.iter() {
            if event.token() == SOCKET_TOKEN {
                readable |= event.is_readable() || event.is_read_closed();
                writable |= event.is_writable() || event.is_write_closed() || event.is_error();
            }
        }

        let resolve_job = {
            let mut state = shared.state.lock().expect("Worker lock poisoned");

            if state.quit {
                break;
            }

            let due = state.resolve.is_some()
                && state
                    .last_resolve_at
                    .map_or(true, |at| at + RESOLVE_RETRY_DELAY <= Instant::now());

            if due {
                state.last_resolve_at = Some(Instant::now());
                state.resolve.take()
            } else {
                None
            }
        };

        if let Some((host, port)) = resolve_job {
            // The lookup may block on DNS; run it with the lock released.
            let resolved = lookup_address(&host, port);

            let mut state = shared.state.lock().expect("Worker lock poisoned");

            if state.resolve.is_some() {
                // A different address was queued in the meantime; this
                // result is stale.
            } else {
                match resolved {
                    Some(address) => {
                        logging::debug!(log, "address resolved";
                                        "context" => "resolve",
                                        "host" => %host,
                                        "address" => %address);
                        state.connection.set_address(address);
                    }
                    None => {
                        logging::warn!(log, "address resolve failed, will retry";
                                       "context" => "resolve",
                                       "host" => %host);
                        state.resolve = Some((host, port));
                    }
                }
            }
        }

        {
            let mut state = shared.state.lock().expect("Worker lock poisoned");

            if state.quit {
                break;
            }

            state.connection.wake_up(readable, writable);
        }
    }
}

fn sync_registration(
    connection: &mut Connection,
    poll: &Poll,
    registered: &mut Option<(u64, Interest)>,
    log: &logging::Logger,
) {
    let plan = connection.poll_plan();

    let wanted = if plan.wants_socket() {
        let interest = match (plan.readable, plan.writable) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, _) => Interest::WRITABLE,
        };

        Some((plan.generation, interest))
    } else {
        None
    };

    if wanted == *registered {
        return;
    }

    // A closed socket leaves the poll set on its own when the fd is
    // dropped, so only (re)registration needs work here.
    if let Some((generation, interest)) = wanted {
        let fresh_socket = match *registered {
            Some((old_generation, _)) => old_generation != generation,
            None => true,
        };

        if let Some(stream) = connection.poll_source() {
            let result = if fresh_socket {
                poll.registry().register(stream, SOCKET_TOKEN, interest)
            } else {
                poll.registry().reregister(stream, SOCKET_TOKEN, interest)
            };

            if let Err(err) = result {
                logging::error!(log, "socket registration failed";
                                "context" => "register",
                                "error" => %err);
            }
        }
    }

    *registered = wanted;
}

fn compute_timeout(state: &State) -> Option<Duration> {
    let now = Instant::now();

    let mut deadline = state.connection.poll_plan().wakeup;

    if state.resolve.is_some() {
        let retry_at = state
            .last_resolve_at
            .map(|at| at + RESOLVE_RETRY_DELAY)
            .unwrap_or(now);

        deadline = Some(match deadline {
            Some(deadline) => deadline.min(retry_at),
            None => retry_at,
        });
    }

    deadline.map(|deadline| deadline.saturating_duration_since(now))
}

/// Parses the host as a literal address first, then falls back to a
/// blocking DNS lookup, returning the first usable result.
fn lookup_address(host: &str, port: u16) -> Option<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }

    match (host, port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next(),
        Err(_) => None,
    }
}
