//! Worker threads hosting one event loop each, plus the round-robin pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::Error;
use crate::event_loop::EventLoop;

/// A named OS thread running one [`EventLoop`].
///
/// The loop is created on the spawned thread (loops bind to their creating
/// thread) and handed back through a channel. Dropping the handle quits the
/// loop and joins the thread.
pub struct EventLoopThread {
    event_loop: Arc<EventLoop>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn start(name: &str) -> Result<EventLoopThread, Error> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let lp = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let _ = tx.send(Ok(lp.clone()));
                lp.run();
            })
            .map_err(Error::Io)?;

        let event_loop = rx
            .recv()
            .map_err(|_| Error::Setup("loop thread exited before handshake".to_string()))??;

        Ok(EventLoopThread {
            event_loop,
            handle: Some(handle),
        })
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Fixed pool of IO loop threads with round-robin assignment.
///
/// With zero threads the base loop hosts everything (single-loop mode).
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    num_threads: usize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
    started: AtomicBool,
    next: AtomicUsize,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, num_threads: usize, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.to_string(),
            num_threads,
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            next: AtomicUsize::new(0),
        }
    }

    pub fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            panic!("EventLoopThreadPool started twice");
        }
        let mut threads = self.threads.lock();
        let mut loops = self.loops.lock();
        for i in 0..self.num_threads {
            let t = EventLoopThread::start(&format!("{}-io-{}", self.name, i))?;
            loops.push(t.event_loop().clone());
            threads.push(t);
        }
        tracing::info!(name = %self.name, threads = self.num_threads, "loop pool started");
        Ok(())
    }

    /// The loop that should host the next connection.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        let loops = self.loops.lock();
        if loops.is_empty() {
            self.base_loop.clone()
        } else {
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
            loops[idx].clone()
        }
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        let loops = self.loops.lock();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }
}
