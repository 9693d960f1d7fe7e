use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::driver::Input;
use crate::signaling::{SignalingChannel, SignalingError, Slot};

/// Store subscriptions held by a session, one forwarding task per slot.
///
/// Each task pumps its subscription into the driver queue. Cancelling awaits the aborted
/// task so the store watch is released by the time the call returns.
#[derive(Default)]
pub(crate) struct Listeners {
    tasks: HashMap<Slot, JoinHandle<()>>,
}

impl Listeners {
    /// Replace any existing subscription on `slot`. Messages are tagged with `attempt` when
    /// they only make sense for one connection attempt.
    pub(crate) async fn watch(
        &mut self,
        signaling: &SignalingChannel,
        slot: Slot,
        attempt: Option<u64>,
        inputs: mpsc::UnboundedSender<Input>,
    ) -> Result<(), SignalingError> {
        self.cancel(slot).await;
        let mut subscription = signaling.subscribe(slot).await?;
        let task = tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                let input = Input::Signal {
                    attempt,
                    slot,
                    message,
                };
                if inputs.send(input).is_err() {
                    break;
                }
            }
            tracing::trace!(slot = %slot, "signaling subscription ended");
        });
        self.tasks.insert(slot, task);
        Ok(())
    }

    pub(crate) async fn cancel(&mut self, slot: Slot) {
        if let Some(task) = self.tasks.remove(&slot) {
            task.abort();
            let _ = task.await;
            tracing::debug!(slot = %slot, "unsubscribed from signaling document");
        }
    }

    pub(crate) async fn cancel_all(&mut self) {
        let slots: Vec<Slot> = self.tasks.keys().copied().collect();
        for slot in slots {
            self.cancel(slot).await;
        }
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}
