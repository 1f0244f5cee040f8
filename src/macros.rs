#![allow(unused_macros)]

/// Helper macro for locking items
///
/// ```rust, ignore
///  let mut data = lock!(my_mutex);
///  data.some_field = 42;
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().expect("Failed to acquire lock")
    };
}

/// Helper macro for acquiring a read lock
macro_rules! read_lock {
    ($lock:expr) => {
        $lock.read().expect("Failed to acquire read lock")
    };
}

/// Helper macro for acquiring a write lock
macro_rules! write_lock {
    ($lock:expr) => {
        $lock.write().expect("Failed to acquire write lock")
    };
}
