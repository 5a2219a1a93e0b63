use std::sync::{Arc, Mutex};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ListenerId(u64);

/// A list of typed listeners addressed by id. Emission snapshots the list
/// first, so listeners are free to add or remove listeners (including
/// themselves) and to call back into the object that is emitting.
pub struct Signal<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

impl<T> Signal<T> {
    pub fn new() -> Signal<T> {
        Signal {
            inner: Mutex::new(Inner {
                next_id: 1,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn add<F: Fn(&T) + Send + Sync + 'static>(&self, listener: F) -> ListenerId {
        let mut inner = self.inner.lock().expect("Signal lock poisoned");

        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));

        ListenerId(id)
    }

    pub fn remove(&self, id: ListenerId) {
        let mut inner = self.inner.lock().expect("Signal lock poisoned");

        inner.listeners.retain(|(listener_id, _)| *listener_id != id.0);
    }

    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = {
            let inner = self.inner.lock().expect("Signal lock poisoned");
            inner.listeners.iter().map(|(_, l)| l.clone()).collect()
        };

        for listener in snapshot {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_all_listeners() {
        let signal = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_a = count.clone();
        signal.add(move |value: &usize| {
            count_a.fetch_add(*value, Ordering::SeqCst);
        });
        let count_b = count.clone();
        signal.add(move |value: &usize| {
            count_b.fetch_add(*value * 10, Ordering::SeqCst);
        });

        signal.emit(&3);

        assert_eq!(count.load(Ordering::SeqCst), 33);
    }

    #[test]
    fn test_removed_listener_not_called() {
        let signal = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_a = count.clone();
        let id = signal.add(move |_: &usize| {
            count_a.fetch_add(1, Ordering::SeqCst);
        });

        signal.emit(&0);
        signal.remove(id);
        signal.emit(&0);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_remove_itself_during_emit() {
        let signal = Arc::new(Signal::new());
        let count = Arc::new(AtomicUsize::new(0));

        let id_cell = Arc::new(Mutex::new(None));

        let signal_ref = signal.clone();
        let id_ref = id_cell.clone();
        let count_ref = count.clone();
        let id = signal.add(move |_: &usize| {
            count_ref.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = id_ref.lock().unwrap().take() {
                signal_ref.remove(id);
            }
        });
        *id_cell.lock().unwrap() = Some(id);

        signal.emit(&0);
        signal.emit(&0);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
