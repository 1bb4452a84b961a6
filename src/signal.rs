#![allow(unsafe_code)]

use std::sync::{Mutex, PoisonError};

lazy_static! {
    static ref CLEANUP: Mutex<Option<Box<dyn Fn() + Send>>> = Mutex::new(None);
}

/// Signals the pipeline sends to its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask politely (SIGTERM).
    Terminate,
    /// Force (SIGKILL).
    Kill,
}

#[cfg(unix)]
impl Signal {
    pub fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as NixSignal;

        match self {
            Self::Terminate => NixSignal::SIGTERM,
            Self::Kill => NixSignal::SIGKILL,
        }
    }
}

/// Runs `handler` once when SIGINT or SIGTERM arrives, then lets the signal
/// take its default course.
///
/// Must be called before any other thread is started, so that they all
/// inherit the signal mask.
#[cfg(unix)]
pub fn install_handler<F>(handler: F)
where
    F: Fn() + 'static + Send + Sync,
{
    use nix::sys::signal::*;
    use std::thread;

    // Mask all termination signals
    // These propagate to all threads started after this point
    let mut mask = SigSet::empty();
    mask.add(SIGTERM);
    mask.add(SIGINT);
    if let Err(err) = mask.thread_set_mask() {
        error!("Unable to set signal mask, signals won't be handled: {}", err);
        return;
    }

    set_handler(handler);

    // Spawn a thread to catch these signals
    let spawned = thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let sig = match mask.wait() {
                Ok(sig) => sig,
                Err(err) => {
                    error!("Unable to wait for signals: {}", err);
                    return;
                }
            };
            debug!("Received {:?}", sig);

            invoke();

            // Restore default behavior for received signal and unmask it
            unsafe {
                let _ = sigaction(
                    sig,
                    &SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()),
                );
            }

            let mut new_mask = SigSet::empty();
            new_mask.add(sig);
            let _ = new_mask.thread_unblock();

            // Re-raise, killing the process
            let _ = raise(sig);
        });

    if let Err(err) = spawned {
        error!("Unable to start the signal thread: {}", err);
    }
}

#[cfg(not(unix))]
pub fn install_handler<F>(handler: F)
where
    F: Fn() + 'static + Send + Sync,
{
    debug!("No signal handling on this platform");
    set_handler(handler);
}

#[cfg_attr(not(unix), allow(dead_code))]
fn invoke() {
    if let Some(ref handler) = *CLEANUP.lock().unwrap_or_else(PoisonError::into_inner) {
        handler()
    }
}

fn set_handler<F>(handler: F)
where
    F: Fn() + 'static + Send + Sync,
{
    *CLEANUP.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(handler));
}
