//! Outbound Messenger
//!
//! Writes operator text to the peripheral's write characteristic. A write
//! runs in the caller's task with the state lock released, so inbound
//! notifications keep flowing while it is in flight.

use crate::domain::error::LinkError;
use crate::domain::models::MessageSeverity;
use crate::infrastructure::bluetooth::connection::{cancellable, LinkShared};
use crate::infrastructure::bluetooth::protocol::encode_text;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct OutboundMessenger {
    shared: Arc<LinkShared>,
}

impl OutboundMessenger {
    pub(crate) fn new(shared: Arc<LinkShared>) -> Self {
        Self { shared }
    }

    /// Send `text` as one write. Without a session nothing is written.
    pub async fn send(&self, text: &str) -> Result<(), LinkError> {
        let (mut epoch, target) = {
            let state = self.shared.lock();
            let epoch = self.shared.watch_epoch(&state);
            let target = state
                .session
                .as_ref()
                .map(|s| (s.link.clone(), s.write_char));
            (epoch, target)
        };

        let Some((link, write_char)) = target else {
            warn!("Send requested without an active session");
            self.shared.log("Not connected", MessageSeverity::Warning);
            return Err(LinkError::NotConnected);
        };

        let payload = encode_text(text);
        debug!(bytes = payload.len(), "Writing to {}", write_char.uuid);

        match cancellable(&mut epoch, link.write(&write_char, &payload)).await {
            Some(Ok(())) => {
                info!("Sent: {}", text);
                self.shared
                    .log(format!("Sent: {}", text), MessageSeverity::Success);
                Ok(())
            }
            Some(Err(e)) => {
                warn!("Write failed: {}", e);
                self.shared
                    .log(format!("Send error: {}", e), MessageSeverity::Error);
                Err(LinkError::Write(e.to_string()))
            }
            None => {
                info!("Write abandoned, session ended");
                self.shared
                    .log("Send cancelled: not connected", MessageSeverity::Warning);
                Err(LinkError::NotConnected)
            }
        }
    }
}
