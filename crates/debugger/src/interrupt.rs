use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Request to stop the forward run to the attach point early
///
/// This is the only state shared with other threads or signal handlers.
/// The server holds the flag; [`InterruptFlag::handle`] hands out setters.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

/// Setter side of an [`InterruptFlag`], safe to move to another thread
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: Arc::clone(&self.flag),
        }
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_sets_flag_from_another_thread() {
        let flag = InterruptFlag::new();
        let handle = flag.handle();
        assert!(!flag.is_set());
        std::thread::spawn(move || handle.interrupt())
            .join()
            .unwrap();
        assert!(flag.is_set());
        flag.clear();
        assert!(!flag.is_set());
    }
}
