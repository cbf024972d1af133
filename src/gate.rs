use crate::Error;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A latch for a value that is populated asynchronously.
///
/// Consumers block in [`ReadyGate::wait`] until a producer calls
/// [`ReadyGate::set`]. Setting again replaces the value, which is how a
/// re-negotiated endpoint is published.
#[derive(Debug)]
pub struct ReadyGate<T> {
    name: &'static str,
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T: Clone> ReadyGate<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub fn set(&self, value: T) {
        *self.value.lock() = Some(value);
        self.ready.notify_all();
    }

    /// Returns the current value without blocking.
    pub fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.value.lock().is_some()
    }

    /// Blocks until a value is available or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<T, Error> {
        let deadline = Instant::now() + timeout;
        let mut value = self.value.lock();

        loop {
            if let Some(value) = value.as_ref() {
                return Ok(value.clone());
            }

            if self.ready.wait_until(&mut value, deadline).timed_out() {
                return value
                    .clone()
                    .ok_or_else(|| Error::Timeout(self.name.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out() {
        let gate: ReadyGate<u32> = ReadyGate::new("media connection");
        let result = gate.wait(Duration::from_millis(20));

        assert_eq!(result, Err(Error::Timeout("media connection".to_string())));
        assert!(!gate.is_ready());
    }

    #[test]
    fn test_wait_returns_value_set_later() {
        let gate = Arc::new(ReadyGate::new("value"));

        let producer = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                gate.set(7u32);
            })
        };

        assert_eq!(gate.wait(Duration::from_secs(5)), Ok(7));
        producer.join().unwrap();

        gate.set(8);
        assert_eq!(gate.get(), Some(8));
    }
}
