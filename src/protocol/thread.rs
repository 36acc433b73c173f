use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{debug, error};

/// Run flag shared between a [`Worker`] and the loop it runs.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A named background thread that loops while its [`RunFlag`] is set.
#[derive(Debug)]
pub struct Worker<T> {
    name: String,
    running: RunFlag,
    thread: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Worker<T> {
    pub fn spawn<F>(name: &str, f: F) -> io::Result<Self>
    where
        F: FnOnce(RunFlag) -> T + Send + 'static,
    {
        let running = RunFlag::new();
        let flag = running.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(flag))?;

        debug!("started {name} worker");
        Ok(Self {
            name: name.to_string(),
            running,
            thread: Some(thread),
        })
    }

    /// Clears the run flag and waits for the loop to return.
    pub fn stop(mut self) -> Option<T> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<T> {
        self.running.clear();
        let thread = self.thread.take()?;

        match thread.join() {
            Ok(out) => {
                debug!("stopped {} worker", self.name);
                Some(out)
            }
            Err(_) => {
                error!("{} worker panicked", self.name);
                None
            }
        }
    }
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        self.running.clear();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{} worker panicked", self.name);
            }
        }
    }
}
