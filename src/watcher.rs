use notify::{raw_watcher, PollWatcher, RecommendedWatcher, RecursiveMode};
use std::path::Path;
use std::sync::mpsc::Sender;

/// Thin wrapper over the notify crate
///
/// `PollWatcher` and `RecommendedWatcher` are distinct types, but the monitor
/// really just wants to handle them without regard to the exact type
/// (e.g. polymorphically). This has the nice side effect of separating out
/// all coupling to the notify crate into this module.
///
/// Directories are registered one at a time and non-recursively: the monitor
/// walks the tree itself so that excluded subtrees are never watched.
pub struct Watcher {
    watcher_impl: WatcherImpl,
}

pub use notify::Error;
pub use notify::RawEvent as Event;

enum WatcherImpl {
    Recommended(RecommendedWatcher),
    Poll(PollWatcher),
}

impl Watcher {
    pub fn new(tx: Sender<Event>, poll: bool, interval_ms: u32) -> Result<Self, Error> {
        let imp = if poll {
            WatcherImpl::Poll(PollWatcher::with_delay_ms(tx, interval_ms)?)
        } else {
            WatcherImpl::Recommended(raw_watcher(tx)?)
        };

        Ok(Self { watcher_impl: imp })
    }

    pub fn watch(&mut self, path: &Path) -> Result<(), Error> {
        use notify::Watcher;

        match &mut self.watcher_impl {
            WatcherImpl::Recommended(w) => w.watch(path, RecursiveMode::NonRecursive)?,
            WatcherImpl::Poll(w) => w.watch(path, RecursiveMode::NonRecursive)?,
        }

        debug!("Watching {:?}", path);
        Ok(())
    }

    pub fn unwatch(&mut self, path: &Path) -> Result<(), Error> {
        use notify::Watcher;

        match &mut self.watcher_impl {
            WatcherImpl::Recommended(w) => w.unwatch(path)?,
            WatcherImpl::Poll(w) => w.unwatch(path)?,
        }

        debug!("Stopped watching {:?}", path);
        Ok(())
    }

    pub fn is_polling(&self) -> bool {
        if let WatcherImpl::Poll(_) = self.watcher_impl {
            true
        } else {
            false
        }
    }
}
