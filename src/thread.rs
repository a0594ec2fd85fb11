//! Spawn-join functionality.
//!
//! **You may not need to check this if it is OK to run stress workers with [`std::thread`].**
//!
//! A key-value store is generally passive. However, some store may require its clients to run on
//! threads it manages. In that case, one may employ its own implementation of spawn-join: the
//! join handle needs to implement [`JoinHandle`] and the spawn struct needs to implement
//! [`Thread`].
//!
//! Worker functions do not return values. Their results are published through shared
//! statistics slots, so a join only reports whether the thread ended normally.

/// A join handle returned by a spawn function.
pub trait JoinHandle: Send {
    /// Join the thread, consume the boxed self. Returns `false` if the thread panicked.
    fn join(self: Box<Self>) -> bool;
}

/// A thread management abstraction.
pub trait Thread: Send + Sync {
    /// Spawn a new named thread using a boxed closure.
    fn spawn(&self, name: String, f: Box<dyn FnOnce() + Send>) -> Box<dyn JoinHandle>;

    /// Pin the current thread to a certain CPU core.
    fn pin(&self, core: usize);
}

/// A zero-sized wrapper for [`std::thread`] functions.
#[derive(Clone)]
pub struct DefaultThread;

/// A wrapper for [`std::thread::JoinHandle`].
pub struct DefaultJoinHandle(std::thread::JoinHandle<()>);

impl JoinHandle for DefaultJoinHandle {
    fn join(self: Box<Self>) -> bool {
        let handle = self.0;
        handle.join().is_ok()
    }
}

impl Thread for DefaultThread {
    fn spawn(&self, name: String, f: Box<dyn FnOnce() + Send>) -> Box<dyn JoinHandle> {
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(f)
            .unwrap_or_else(|e| panic!("failed to spawn stressor thread: {}", e));
        Box::new(DefaultJoinHandle(handle))
    }

    fn pin(&self, core: usize) {
        match core_affinity::get_core_ids() {
            Some(cores) if !cores.is_empty() => {
                core_affinity::set_for_current(cores[core % cores.len()]);
            }
            _ => log::warn!("Unable to pin thread to core {}: no core ids available", core),
        }
    }
}
