//! Inactivity auto-lock.
//!
//! One task per unlock epoch. The task only holds a `Weak` reference to the
//! vault, and both the expiry check and the lock itself happen under the
//! state mutex that also records activity.

use super::VaultInner;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

/// Default inactivity window.
pub const DEFAULT_AUTO_LOCK: Duration = Duration::from_secs(15 * 60);

pub(crate) fn spawn(vault: Weak<VaultInner>, epoch: u64, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let deadline = {
                let Some(inner) = vault.upgrade() else {
                    return;
                };
                let state = inner.state.lock();
                if state.epoch != epoch || state.locked {
                    return;
                }
                let deadline = state.last_activity + timeout;
                deadline
            };

            sleep_until(deadline).await;

            let Some(inner) = vault.upgrade() else {
                return;
            };
            let mut state = inner.state.lock();
            if state.epoch != epoch || state.locked {
                return;
            }
            if Instant::now() >= state.last_activity + timeout {
                info!("Vault idle for {:?}, locking", timeout);
                state.lock_now();
                return;
            }
            debug!("Activity since last check, auto-lock rescheduled");
        }
    })
}
