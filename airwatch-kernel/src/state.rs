use parking_lot::Mutex;
use std::sync::Arc;

/// Cell the Ingestion Loop writes its snapshot into and HTTP handlers read from.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Clones the current value out so no lock is held across an await.
pub fn read_state<T: Clone>(state: &Shared<T>) -> T {
    state.lock().clone()
}
