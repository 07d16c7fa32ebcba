use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use log::{debug, warn};

use super::server::ServerError;

/// Runs every client session on its own thread.
///
/// Sessions live as long as their client keeps the channel open, so they are
/// never queued behind one another. `limit` caps how many may be live at once;
/// past it new sessions are refused instead of waiting.
#[derive(Debug)]
pub struct SessionThreads {
    limit: usize,
    live: Arc<AtomicUsize>,
    spawned: u64,
    handles: Vec<thread::JoinHandle<()>>,
}

/// Decrements the live count when a session thread ends, panics included.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SessionThreads {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            live: Arc::new(AtomicUsize::new(0)),
            spawned: 0,
            handles: Vec::new(),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn spawn<F>(&mut self, session: F) -> Result<(), ServerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reap();
        if self.live() >= self.limit {
            return Err(ServerError::TooManySessions(self.limit));
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live));
        self.spawned += 1;
        let handle = thread::Builder::new()
            .name(format!("session-{}", self.spawned))
            .spawn(move || {
                let _guard = guard;
                session();
            })?;
        self.handles.push(handle);
        Ok(())
    }

    /// Joins the threads of sessions that have ended.
    fn reap(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) =
            self.handles.drain(..).partition(|h| h.is_finished());
        self.handles = running;

        for handle in done {
            let name = handle.thread().name().unwrap_or("session").to_string();
            match handle.join() {
                Ok(()) => debug!("{name} joined"),
                Err(_) => warn!("{name} panicked"),
            }
        }
    }
}
