//! Inbound data fan-out.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace};

/// Consumer of characteristic data from connected devices
pub trait DataHandler: Send + Sync {
    fn handle_data(&self, device_name: &str, payload: &[u8]) -> anyhow::Result<()>;
}

impl<F> DataHandler for F
where
    F: Fn(&str, &[u8]) -> anyhow::Result<()> + Send + Sync,
{
    fn handle_data(&self, device_name: &str, payload: &[u8]) -> anyhow::Result<()> {
        self(device_name, payload)
    }
}

/// Decide whether `payload` is new for a device and update its cache.
///
/// The first payload always passes; later ones only when they differ
/// byte-for-byte from the cached value.
pub fn accept_payload(cache: &mut Option<Vec<u8>>, payload: &[u8]) -> bool {
    match cache {
        Some(previous) if previous.as_slice() == payload => false,
        _ => {
            *cache = Some(payload.to_vec());
            true
        }
    }
}

#[derive(Default)]
pub struct DataDispatcher {
    handlers: Vec<Arc<dyn DataHandler>>,
}

impl DataDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the same handler is already registered
    pub fn register(&mut self, handler: Arc<dyn DataHandler>) -> bool {
        if self.handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        self.handlers.push(handler);
        true
    }

    pub fn unregister(&mut self, handler: &Arc<dyn DataHandler>) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|h| !Arc::ptr_eq(h, handler));
        before != self.handlers.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Hand a payload to every handler. A failing handler is logged and
    /// skipped; the rest still run. Returns how many succeeded.
    pub fn dispatch(&self, device_name: &str, payload: &[u8]) -> usize {
        trace!("Dispatching {} bytes from {}", payload.len(), device_name);

        let mut delivered = 0;
        for handler in &self.handlers {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| handler.handle_data(device_name, payload)));
            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!("Data handler failed for {}: {:#}", device_name, e);
                }
                Err(_) => {
                    error!("Data handler panicked for {}", device_name);
                }
            }
        }
        delivered
    }
}

impl std::fmt::Debug for DataDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl DataHandler for Recorder {
        fn handle_data(&self, device_name: &str, payload: &[u8]) -> anyhow::Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((device_name.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn test_accept_payload_suppresses_duplicates() {
        let mut cache = None;
        assert!(accept_payload(&mut cache, &[1, 2, 3]));
        assert!(!accept_payload(&mut cache, &[1, 2, 3]));
        assert!(accept_payload(&mut cache, &[1, 2, 4]));
        assert!(accept_payload(&mut cache, &[1, 2, 3]));
        assert_eq!(cache, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut dispatcher = DataDispatcher::new();
        let handler: Arc<dyn DataHandler> = Arc::new(Recorder::default());
        assert!(dispatcher.register(handler.clone()));
        assert!(!dispatcher.register(handler.clone()));
        assert_eq!(dispatcher.len(), 1);

        assert!(dispatcher.unregister(&handler));
        assert!(!dispatcher.unregister(&handler));
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_failing_handlers_do_not_stop_fan_out() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = DataDispatcher::new();
        dispatcher.register(Arc::new(|_: &str, _: &[u8]| -> anyhow::Result<()> {
            anyhow::bail!("parse failed")
        }));
        dispatcher.register(Arc::new(|_: &str, _: &[u8]| -> anyhow::Result<()> {
            panic!("handler bug")
        }));
        dispatcher.register(recorder.clone());

        assert_eq!(dispatcher.dispatch("Robot", &[0xAA]), 1);
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("Robot".to_string(), vec![0xAA])]);
    }
}
