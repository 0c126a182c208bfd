//! C11: functional-UI helpers.
//!
//! Out of scope as a full implementation — these are "thin adapters"
//! specified only at the interface level: given a client/device handle,
//! hand back an observable whose setup/teardown is bound to the
//! subscription guard's lifetime, with no coupling to any particular UI
//! framework's reactivity model. A framework binding layer builds on top
//! of these, it does not live here.

use futures_core::Stream;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::controller::{ConnectionState, Controller};
use crate::device::{Device, StateChangeSubscription};
use crate::error::CoreError;
use crate::model::StateRecord;

/// (i) Resolve a device handle by id, enumerating devices on first use.
pub async fn device_cell(controller: &Controller, device_id: &str) -> Result<Device, CoreError> {
    controller
        .get_device(device_id)
        .await?
        .ok_or_else(|| CoreError::DeviceNotFound(device_id.to_owned()))
}

/// (ii) An observable cell bound to one state on one device: a stream of
/// that state's records, re-emitted every time `STATE_CHANGED` fires for
/// its id. Dropping the returned guard tears down the subscription —
/// bind its lifetime to the UI component's.
pub struct StateCell {
    _subscription: StateChangeSubscription,
}

impl StateCell {
    /// Subscribe to `device`'s `STATE_CHANGED` events for `state_id`,
    /// re-fetching the canonical [`StateRecord`] from the device's
    /// catalog on each one so the observable always carries the full
    /// record rather than just the changed fields.
    #[must_use]
    pub fn watch(device: &Device, state_id: &str) -> (Self, impl Stream<Item = StateRecord> + Send + 'static) {
        let subscription = device.subscribe_state_changed();
        let wanted = state_id.to_owned();
        let mut receiver = subscription.receiver.resubscribe();
        let device = device.clone();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.id == wanted => {
                        if let Some(record) = device.get_state(&wanted).await {
                            yield record;
                        }
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        (
            Self {
                _subscription: subscription,
            },
            stream,
        )
    }
}

/// (iii) An observable of the controller's connection status, tracking
/// `CONNECTION_STATUS_CHANGED`. Backed directly by the state machine's
/// `watch` channel rather than the event bus, since `watch` already gives
/// "latest value plus change notification" semantics for free.
#[must_use]
pub fn connection_status_cell(controller: &Controller) -> impl Stream<Item = ConnectionState> + Send + 'static {
    WatchStream::new(controller.subscribe_connection_state())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;

    #[tokio::test]
    async fn connection_status_cell_observes_current_state() {
        let controller = Controller::new("ui-bindings-test:8000", ClientOptions::default());
        let mut stream = Box::pin(connection_status_cell(&controller));
        let first = stream.next().await.unwrap();
        assert_eq!(first, ConnectionState::Connecting);
    }
}
