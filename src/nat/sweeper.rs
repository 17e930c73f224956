//! Background expiry thread
//!
//! Calls a tick closure once per interval until told to stop. The wait
//! happens on a channel with a timeout, so [`Sweeper::stop`] wakes the thread
//! immediately instead of waiting out the interval, and the thread never
//! holds the table lock while idle.

use crate::Result;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Handle to a running sweeper thread
#[derive(Debug)]
pub struct Sweeper {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Start the thread. `tick` runs after every `interval`; returning false
    /// ends the thread (the NAT it serves has shut down).
    pub fn spawn<F>(interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("nat-sweeper".into())
            .spawn(move || {
                debug!("NAT sweeper started, interval {:?}", interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if !tick() {
                        break;
                    }
                }
                debug!("NAT sweeper stopped");
            })?;

        Ok(Self { stop_tx, handle })
    }

    /// Signal the thread and wait for it to finish its current tick
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("NAT sweeper thread panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
