//! The rotating bootstrap key (§4.3 `rotate_bootstrap_key`): a key
//! independent of any account, used only to decrypt register-handshake
//! frames sent under the literal account `"-----"`.
//!
//! Regenerated every 180 seconds; any call to [`BootstrapKeyRotator::current`]
//! resets the timer, so an operator copying the bootstrap blob pins the key
//! long enough to hand it to a new peer.

use bus_codec::Key;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const ROTATE_EVERY: Duration = Duration::from_secs(180);
const TICK: Duration = Duration::from_secs(1);

pub struct BootstrapKeyRotator {
    watch_rx: watch::Receiver<Key>,
    reset_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl BootstrapKeyRotator {
    pub fn spawn() -> Self {
        let (watch_tx, watch_rx) = watch::channel(Key::generate());
        let (reset_tx, mut reset_rx) = mpsc::channel::<()>(8);

        let handle = tokio::spawn(async move {
            let mut last_reset = Instant::now();
            let mut tick = tokio::time::interval(TICK);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if last_reset.elapsed() >= ROTATE_EVERY {
                            let fresh = Key::generate();
                            tracing::info!("rotating bootstrap key");
                            if watch_tx.send(fresh).is_err() {
                                break;
                            }
                            last_reset = Instant::now();
                        }
                    }
                    received = reset_rx.recv() => {
                        match received {
                            Some(()) => last_reset = Instant::now(),
                            None => break,
                        }
                    }
                }
            }
        });

        BootstrapKeyRotator {
            watch_rx,
            reset_tx,
            handle,
        }
    }

    /// The current bootstrap key. Resets the 180-second rotation timer.
    pub fn current(&self) -> Key {
        let _ = self.reset_tx.try_send(());
        self.watch_rx.borrow().clone()
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}
