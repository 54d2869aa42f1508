//! Shutdown hook registry.
//!
//! The host wires SIGINT/SIGTERM to a single [`ShutdownHooks::run`] call.
//! Handlers that hold resources (watchers, REPL terminals, temp dirs)
//! register disposers here; registration returns a handle that can be used
//! to deregister. The run is once-only: a second signal or a normal exit
//! path calling `run` again finds nothing to do.

use std::sync::{Arc, Mutex};

use anyhow::Result;

type Disposer = Box<dyn FnOnce() -> Result<()> + Send>;

#[derive(Default)]
struct HookList {
    next_id: u64,
    hooks: Vec<(u64, Disposer)>,
    ran: bool,
}

/// Handle returned by [`ShutdownHooks::register`]; pass it back to
/// [`ShutdownHooks::deregister`] to remove the disposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHandle(u64);

/// Ordered, once-only shutdown hook registry. Cloning shares the list, so
/// the signal handler and the dispatch path observe the same hooks.
#[derive(Clone, Default)]
pub struct ShutdownHooks {
    inner: Arc<Mutex<HookList>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a disposer. Disposers run in registration order.
    /// Registration after the hooks have run is accepted but the disposer
    /// will never fire.
    pub fn register<F>(&self, disposer: F) -> HookHandle
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut list = self.inner.lock().expect("hook registry poisoned");
        let id = list.next_id;
        list.next_id += 1;
        list.hooks.push((id, Box::new(disposer)));
        HookHandle(id)
    }

    /// Remove a registered disposer. Returns true when something was
    /// removed.
    pub fn deregister(&self, handle: HookHandle) -> bool {
        let mut list = self.inner.lock().expect("hook registry poisoned");
        let before = list.hooks.len();
        list.hooks.retain(|(id, _)| *id != handle.0);
        list.hooks.len() != before
    }

    /// Run all registered disposers once, in registration order, collecting
    /// their errors. Subsequent calls return an empty list.
    pub fn run(&self) -> Vec<anyhow::Error> {
        let hooks = {
            let mut list = self.inner.lock().expect("hook registry poisoned");
            if list.ran {
                return Vec::new();
            }
            list.ran = true;
            std::mem::take(&mut list.hooks)
        };

        let mut errors = Vec::new();
        for (_, disposer) in hooks {
            if let Err(e) = disposer() {
                errors.push(e);
            }
        }
        errors
    }

    /// Whether the hooks have already run.
    pub fn has_run(&self) -> bool {
        self.inner.lock().expect("hook registry poisoned").ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn hooks_run_in_registration_order() {
        let hooks = ShutdownHooks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            hooks.register(move || {
                order.lock().expect("lock").push(label);
                Ok(())
            });
        }

        let errors = hooks.run();
        assert!(errors.is_empty());
        assert_eq!(*order.lock().expect("lock"), vec!["first", "second", "third"]);
    }

    #[test]
    fn run_is_once_only() {
        let hooks = ShutdownHooks::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        hooks.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        hooks.run();
        hooks.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(hooks.has_run());
    }

    #[test]
    fn deregistered_hooks_do_not_fire() {
        let hooks = ShutdownHooks::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let handle = hooks.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(hooks.deregister(handle));
        assert!(!hooks.deregister(handle));
        hooks.run();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn errors_are_collected_and_do_not_stop_the_chain() {
        let hooks = ShutdownHooks::new();
        let count = Arc::new(AtomicUsize::new(0));

        hooks.register(|| anyhow::bail!("first disposer failed"));
        let counter = Arc::clone(&count);
        hooks.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let errors = hooks.run();
        assert_eq!(errors.len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_the_registry() {
        let hooks = ShutdownHooks::new();
        let clone = hooks.clone();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        clone.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        hooks.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(clone.has_run());
    }
}
