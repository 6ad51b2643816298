//! The listener loop: drains the IPC queue and publishes one record per event.
//!
//! Strictly sequential. A slow or retrying publish holds up the queue; no
//! event is read until the previous one is fully handled.

use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, Connector};
use crate::event::Event;
use crate::ipc::{self, IpcError, IpcReceiver};
use crate::message::MessageBuilder;

pub struct Listener<C> {
    receiver: IpcReceiver,
    builder: MessageBuilder,
    client: BrokerClient<C>,
    runtime: Runtime,
}

impl<C: Connector> Listener<C> {
    /// `runtime` drives the broker client; a current-thread runtime is enough.
    pub fn new(
        receiver: IpcReceiver,
        builder: MessageBuilder,
        client: BrokerClient<C>,
        runtime: Runtime,
    ) -> Self {
        Self {
            receiver,
            builder,
            client,
            runtime,
        }
    }

    /// Consume events until Shutdown, then close the broker connection and
    /// release the queue. The result is the outcome of the release.
    pub fn run(self) -> ipc::Result<()> {
        let Self {
            mut receiver,
            builder,
            mut client,
            runtime,
        } = self;

        info!(queue = %receiver.path().display(), user = %builder.user(), "Listener started");

        loop {
            match receiver.receive() {
                Ok(Event::Shutdown) => {
                    info!("Shutdown received");
                    break;
                }
                Ok(event) => handle(&runtime, &builder, &mut client, &event),
                Err(e @ (IpcError::UnknownTag(_) | IpcError::Malformed(_))) => {
                    warn!(error = %e, "Discarding IPC frame");
                }
                Err(e) => {
                    error!(error = %e, "IPC queue unreadable, stopping listener");
                    break;
                }
            }
        }

        if let Err(e) = runtime.block_on(client.close()) {
            warn!(error = %e, "Broker connection did not close cleanly");
        }
        receiver.release()
    }
}

fn handle<C: Connector>(
    runtime: &Runtime,
    builder: &MessageBuilder,
    client: &mut BrokerClient<C>,
    event: &Event,
) {
    debug!(kind = %event.kind(), path = event.path().unwrap_or_default(), "Event received");

    let record = match builder.record_for(event) {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            error!(kind = %event.kind(), error = %e, "Cannot build audit record, dropping event");
            return;
        }
    };
    let payload = match record.to_payload() {
        Ok(payload) => payload,
        Err(e) => {
            error!(kind = %event.kind(), error = %e, "Cannot encode audit record, dropping event");
            return;
        }
    };

    match runtime.block_on(client.publish(&payload)) {
        Ok(receipt) => info!(
            kind = %event.kind(),
            attempts = receipt.attempts,
            correlation_id = %receipt.correlation_id,
            "Audit record published"
        ),
        Err(e) => error!(kind = %event.kind(), error = %e, "Audit record dropped"),
    }
}
