//! The change watcher.
//!
//! A [`Monitor`] walks a directory tree, registers a watch on every directory
//! that isn't excluded, and turns the resulting stream of raw notifications
//! into [`Event::RebuildRequested`] triggers on the exchange.
//!
//! Native back-ends routinely report several events for one logical write, so
//! triggers are debounced through an [`MtimeCache`]: a path only triggers when
//! its modification time differs from the last one seen, or when it can no
//! longer be stat'ed.

use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use notify::op;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::exchange::{Event, Exchange};
use crate::notification_filter::NotificationFilter;
use crate::pathop::{Op, PathOp};
use crate::watcher::{self, Watcher};

/// Last observed modification time per path.
#[derive(Debug, Default)]
pub struct MtimeCache {
    mtimes: HashMap<PathBuf, SystemTime>,
}

impl MtimeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result of stat'ing `path` and reports whether it amounts
    /// to a change.
    ///
    /// `None` means the stat failed, most likely because the file is gone:
    /// the entry is evicted and that always counts as a change.
    pub fn observe(&mut self, path: &Path, mtime: Option<SystemTime>) -> bool {
        match mtime {
            None => {
                if self.mtimes.remove(path).is_some() {
                    trace!("Forgot mtime of {:?}", path);
                }
                true
            }
            Some(mtime) => {
                if self.mtimes.get(path) == Some(&mtime) {
                    trace!("Unchanged mtime for {:?}, dropping event", path);
                    false
                } else {
                    self.mtimes.insert(path.to_path_buf(), mtime);
                    true
                }
            }
        }
    }

    pub fn get(&self, path: &Path) -> Option<SystemTime> {
        self.mtimes.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.mtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mtimes.is_empty()
    }
}

/// Stops a running [`Monitor::watch`] from another thread.
///
/// Meant to be called once; later calls only re-send the wake-up.
#[derive(Clone)]
pub struct Closer {
    closed: Arc<AtomicBool>,
    tx: Arc<Mutex<Sender<watcher::Event>>>,
}

impl Closer {
    pub fn close(&self) {
        debug!("Closing the monitor");
        self.closed.store(true, Ordering::SeqCst);

        // wake the event loop with an event that carries no path
        let wake = watcher::Event {
            path: None,
            op: Ok(op::Op::empty()),
            cookie: None,
        };
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if tx.send(wake).is_err() {
            debug!("Monitor already gone");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct Monitor {
    watcher: Watcher,
    rx: Receiver<watcher::Event>,
    closer: Closer,
    filter: NotificationFilter,
    exchange: Exchange,
    watching: HashSet<PathBuf>,
    mtimes: MtimeCache,
    run_initially: bool,
}

impl Monitor {
    /// Sets up the OS watch mechanism; `poll` selects the polling back-end
    /// with the given interval instead of native notifications.
    ///
    /// Exclusion patterns are compiled here, so a malformed one is reported
    /// before anything is watched.
    pub fn new(exchange: Exchange, ignores: &[String], poll: Option<Duration>) -> Result<Self> {
        let filter = NotificationFilter::new(Path::new(""), ignores)?;

        let (tx, rx) = channel();
        let interval = poll.map_or(0, |d| u32::try_from(d.as_millis()).unwrap_or(u32::MAX));
        let watcher = Watcher::new(tx.clone(), poll.is_some(), interval)?;
        if watcher.is_polling() {
            warn!("Polling for changes every {} ms", interval);
        }

        Ok(Self {
            watcher,
            rx,
            closer: Closer {
                closed: Arc::new(AtomicBool::new(false)),
                tx: Arc::new(Mutex::new(tx)),
            },
            filter,
            exchange,
            watching: HashSet::new(),
            mtimes: MtimeCache::new(),
            run_initially: true,
        })
    }

    /// Whether the initial scan fires a trigger when it finds any file.
    pub fn run_initially(mut self, run_initially: bool) -> Self {
        self.run_initially = run_initially;
        self
    }

    pub fn closer(&self) -> Closer {
        self.closer.clone()
    }

    /// Directories currently under watch, sorted.
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<_> = self.watching.iter().cloned().collect();
        dirs.sort();
        dirs
    }

    /// Scans `root` and then blocks, handling filesystem events, until the
    /// [`Closer`] is used.
    ///
    /// Only failing to register `root` itself is an error; every later
    /// failure is logged and the loop carries on.
    pub fn watch(&mut self, root: &Path) -> Result<()> {
        let root = root
            .canonicalize()
            .map_err(|err| Error::Canonicalization(root.display().to_string(), err))?;
        self.filter.rebase(&root);

        let has_files = self.add_path(&root, true)?;
        info!("Watching {} directories under {:?}", self.watching.len(), self.filter.root());
        if self.run_initially && has_files {
            self.trigger();
        }

        loop {
            if self.closer.is_closed() {
                break;
            }

            let event = match self.rx.recv() {
                Ok(event) => event,
                Err(_) => {
                    warn!("Watch channel disconnected");
                    break;
                }
            };

            if self.closer.is_closed() {
                break;
            }
            self.handle(event);
        }

        debug!("Monitor stopped");
        Ok(())
    }

    fn handle(&mut self, event: watcher::Event) {
        let raw_op = match event.op {
            Ok(op) => op,
            Err(err) => {
                error!("Watch error on {:?}: {}", event.path, err);
                return;
            }
        };

        let path = match event.path {
            Some(path) => path,
            None => return,
        };

        match PathOp::from_raw(&path, raw_op) {
            Some(pathop) => self.dispatch(&pathop),
            None => trace!("Ignoring {:?} on {:?}", raw_op, path),
        }
    }

    fn dispatch(&mut self, pathop: &PathOp) {
        let path = &pathop.path;
        debug!("{:?} {:?}", pathop.op, path);

        let queue = match pathop.op {
            Op::Create => self.rescan(path),
            Op::Remove => {
                self.evict(path);
                true
            }
            Op::Rename => {
                if path.is_dir() {
                    self.rescan(path);
                } else if !path.exists() {
                    self.evict(path);
                }
                true
            }
            Op::Write => true,
        };

        if queue {
            self.maybe_queue(path);
        }
    }

    /// Watches `path` and every directory below it that isn't excluded.
    ///
    /// Returns whether the walk came across any file. With `strict`, failing
    /// to read or watch `path` itself is returned as an error; otherwise all
    /// failures are logged and skipped.
    fn add_path(&mut self, path: &Path, strict: bool) -> Result<bool> {
        if self.watching.contains(path) {
            return Ok(false);
        }

        let filter = &self.filter;
        let watcher = &mut self.watcher;
        let watching = &mut self.watching;
        let mut has_files = false;

        let walker = WalkDir::new(path)
            .into_iter()
            .filter_entry(|entry| !entry.file_type().is_dir() || !filter.is_excluded(entry.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if strict && err.depth() == 0 {
                        return Err(Error::Io(err.into()));
                    }
                    warn!("Couldn't scan {:?}: {}", err.path(), err);
                    continue;
                }
            };

            if !entry.file_type().is_dir() {
                has_files = true;
                continue;
            }

            if watching.contains(entry.path()) {
                continue;
            }

            match watcher.watch(entry.path()) {
                Ok(()) => {
                    watching.insert(entry.path().to_path_buf());
                }
                Err(err) if strict && entry.depth() == 0 => return Err(err.into()),
                Err(err) => warn!("Couldn't watch {:?}: {}", entry.path(), err),
            }
        }

        Ok(has_files)
    }

    /// Scans a path that appeared while the loop was running. Reports whether
    /// it brought any file along.
    fn rescan(&mut self, path: &Path) -> bool {
        match self.add_path(path, false) {
            Ok(has_files) => has_files,
            Err(err) => {
                warn!("Couldn't scan {:?}: {}", path, err);
                false
            }
        }
    }

    /// Drops `path` and every watched directory below it.
    fn evict(&mut self, path: &Path) {
        let doomed: Vec<PathBuf> = self
            .watching
            .iter()
            .filter(|dir| dir.starts_with(path))
            .cloned()
            .collect();

        for dir in doomed {
            // the OS usually drops watches on deleted directories by itself
            if let Err(err) = self.watcher.unwatch(&dir) {
                debug!("Couldn't unwatch {:?}: {}", dir, err);
            }
            self.watching.remove(&dir);
        }
    }

    fn maybe_queue(&mut self, path: &Path) {
        if self.filter.is_excluded(path) {
            return;
        }

        let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
        if self.mtimes.observe(path, mtime) {
            debug!("Change to {:?} warrants a rebuild", path);
            self.trigger();
        }
    }

    fn trigger(&self) {
        self.exchange.send(Event::RebuildRequested);
    }
}

#[cfg(test)]
mod tests {
    use super::{Monitor, MtimeCache};
    use crate::exchange::{Exchange, Topic};
    use crate::watcher::Event;
    use notify::op;
    use std::fs;
    use std::path::Path;
    use std::sync::mpsc::{channel, Receiver};
    use std::time::{Duration, SystemTime};

    fn monitor(ignores: &[&str]) -> (Monitor, Receiver<()>) {
        let exchange = Exchange::new();
        let (tx, rx) = channel();
        exchange.listen(Topic::RebuildRequested, move |_| {
            let _ = tx.send(());
        });

        let ignores: Vec<String> = ignores.iter().map(|s| (*s).to_string()).collect();
        (Monitor::new(exchange, &ignores, None).unwrap(), rx)
    }

    fn event(path: &Path, op: op::Op) -> Event {
        Event {
            path: Some(path.to_path_buf()),
            op: Ok(op),
            cookie: None,
        }
    }

    fn count(rx: &Receiver<()>) -> usize {
        let mut n = 0;
        while rx.recv_timeout(Duration::from_millis(300)).is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn unchanged_mtime_is_not_a_change() {
        let mut cache = MtimeCache::new();
        let path = Path::new("/tmp/a.txt");
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(10);

        assert!(cache.observe(path, Some(t)));
        assert!(!cache.observe(path, Some(t)));
        assert_eq!(cache.get(path), Some(t));
    }

    #[test]
    fn changed_mtime_is_a_change() {
        let mut cache = MtimeCache::new();
        let path = Path::new("/tmp/a.txt");
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(10);

        assert!(cache.observe(path, Some(t)));
        assert!(cache.observe(path, Some(t + Duration::from_nanos(1))));
        assert_eq!(cache.get(path), Some(t + Duration::from_nanos(1)));
    }

    #[test]
    fn missing_file_is_a_change_and_clears_cache() {
        let mut cache = MtimeCache::new();
        let path = Path::new("/tmp/a.txt");
        let t = SystemTime::UNIX_EPOCH;

        cache.observe(path, Some(t));
        assert!(cache.observe(path, None));
        assert!(cache.get(path).is_none());
        assert!(cache.is_empty());
        assert!(cache.observe(path, None));
    }

    #[test]
    fn scan_skips_excluded_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::create_dir_all(root.join("target/debug")).unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();

        let (mut monitor, _rx) = monitor(&["target"]);
        monitor.filter.rebase(&root);

        assert!(monitor.add_path(&root, true).unwrap());
        assert_eq!(
            monitor.watched_dirs(),
            vec![root.clone(), root.join("src"), root.join("src/nested")]
        );
        assert!(!monitor.add_path(&root, true).unwrap());
    }

    #[test]
    fn scan_of_empty_tree_finds_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("a/b")).unwrap();

        let (mut monitor, _rx) = monitor(&[]);
        monitor.filter.rebase(&root);

        assert!(!monitor.add_path(&root, true).unwrap());
        assert_eq!(monitor.watched_dirs().len(), 3);
    }

    #[test]
    fn eviction_drops_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::create_dir_all(root.join("ab")).unwrap();

        let (mut monitor, _rx) = monitor(&[]);
        monitor.filter.rebase(&root);
        monitor.add_path(&root, true).unwrap();

        monitor.evict(&root.join("a"));
        assert_eq!(monitor.watched_dirs(), vec![root.clone(), root.join("ab")]);
    }

    #[test]
    fn repeated_stat_triggers_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let file = root.join("main.rs");
        fs::write(&file, "fn main() {}").unwrap();

        let (mut monitor, rx) = monitor(&[]);
        monitor.filter.rebase(&root);

        monitor.maybe_queue(&file);
        monitor.maybe_queue(&file);
        assert_eq!(count(&rx), 1);
        assert!(monitor.mtimes.get(&file).is_some());

        fs::remove_file(&file).unwrap();
        monitor.maybe_queue(&file);
        assert_eq!(count(&rx), 1);
        assert!(monitor.mtimes.get(&file).is_none());
    }

    #[test]
    fn excluded_paths_never_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let file = root.join("notes.swp");
        fs::write(&file, "").unwrap();

        let (mut monitor, rx) = monitor(&["*.swp"]);
        monitor.filter.rebase(&root);

        monitor.maybe_queue(&file);
        monitor.maybe_queue(&root.join("gone.swp"));
        assert_eq!(count(&rx), 0);
        assert!(monitor.mtimes.is_empty());
    }

    #[test]
    fn closer_is_shared() {
        let (monitor, _rx) = monitor(&[]);
        let closer = monitor.closer();

        assert!(!monitor.closer.is_closed());
        closer.close();
        assert!(monitor.closer.is_closed());
    }

    #[test]
    fn created_empty_directory_is_watched_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let (mut monitor, rx) = monitor(&[]);
        monitor.filter.rebase(&root);
        monitor.add_path(&root, true).unwrap();

        fs::create_dir_all(root.join("empty/nested")).unwrap();
        monitor.handle(event(&root.join("empty"), op::CREATE));

        assert_eq!(count(&rx), 0);
        assert_eq!(
            monitor.watched_dirs(),
            vec![root.clone(), root.join("empty"), root.join("empty/nested")]
        );
    }

    #[test]
    fn created_directory_with_files_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let (mut monitor, rx) = monitor(&[]);
        monitor.filter.rebase(&root);
        monitor.add_path(&root, true).unwrap();

        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/lib.rs"), "").unwrap();
        monitor.handle(event(&root.join("src"), op::CREATE));

        assert_eq!(count(&rx), 1);
        assert!(monitor.watched_dirs().contains(&root.join("src")));
    }

    #[test]
    fn removed_directory_is_evicted_with_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::create_dir_all(root.join("keep")).unwrap();

        let (mut monitor, rx) = monitor(&[]);
        monitor.filter.rebase(&root);
        monitor.add_path(&root, true).unwrap();
        assert_eq!(monitor.watched_dirs().len(), 5);

        fs::remove_dir_all(root.join("a")).unwrap();
        monitor.handle(event(&root.join("a"), op::REMOVE));

        assert_eq!(monitor.watched_dirs(), vec![root.clone(), root.join("keep")]);
        assert_eq!(count(&rx), 1);
    }

    #[test]
    fn renamed_directory_moves_its_watches() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("old/sub")).unwrap();
        fs::write(root.join("old/sub/file.txt"), "").unwrap();

        let (mut monitor, rx) = monitor(&[]);
        monitor.filter.rebase(&root);
        monitor.add_path(&root, true).unwrap();

        fs::rename(root.join("old"), root.join("new")).unwrap();
        monitor.handle(event(&root.join("old"), op::RENAME));
        monitor.handle(event(&root.join("new"), op::RENAME));

        assert_eq!(
            monitor.watched_dirs(),
            vec![root.clone(), root.join("new"), root.join("new/sub")]
        );
        assert!(count(&rx) >= 1);
    }

    #[test]
    fn events_without_a_path_or_with_errors_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let (mut monitor, rx) = monitor(&[]);
        monitor.filter.rebase(&root);

        monitor.handle(Event {
            path: None,
            op: Ok(op::WRITE),
            cookie: None,
        });
        monitor.handle(Event {
            path: Some(root.join("x")),
            op: Err(notify::Error::Generic("boom".into())),
            cookie: None,
        });
        monitor.handle(event(&root.join("x"), op::CHMOD));

        assert_eq!(count(&rx), 0);
    }
}
