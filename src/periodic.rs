use crate::CrawlError;
use crossbeam_channel::{select, tick, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// A named background thread that runs `work` on a fixed period until
/// stopped.
///
/// Ticks never overlap: the next tick is only taken after `work` returns,
/// and ticks that fire meanwhile collapse into at most one. Stopping waits
/// for the tick in progress to finish; it is never interrupted.
pub struct PeriodicTask {
    name: String,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &str, interval: Duration, mut work: F) -> Result<Self, CrawlError>
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(ticker) -> _ => work(),
                    }
                }
                debug!(task = %thread_name, "periodic task exited");
            })?;

        Ok(Self {
            name: name.to_string(),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        // Dropping the sender disconnects the channel, which wakes the loop.
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
