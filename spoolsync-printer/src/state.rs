use parking_lot::Mutex;
use std::sync::Arc;

/// State shared between the session task and its readers.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Clones the current value out of the lock so readers never hold it.
pub fn snapshot<T: Clone>(state: &Shared<T>) -> T {
    state.lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let state = new_state(vec![1, 2]);
        let before = snapshot(&state);
        state.lock().push(3);
        assert_eq!(before, vec![1, 2]);
        assert_eq!(snapshot(&state), vec![1, 2, 3]);
    }
}
