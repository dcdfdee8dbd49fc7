//! Acknowledgement Tracking
//!
//! Assigns `msgSerial` to outbound publishes and resolves their completion
//! callbacks when the service acknowledges them.

use std::collections::BTreeMap;
use std::fmt;

use crate::connection::ConnectionState;
use crate::error::ErrorInfo;
use crate::protocol::{Action, ProtocolMessage};

/// Completion callback for a publish awaiting acknowledgement
pub type AckCallback = Box<dyn FnOnce(Result<(), ErrorInfo>) + Send + 'static>;

/// Pending acknowledgements keyed by assigned serial
pub struct AckTracker {
    /// Next serial to assign
    msg_serial: u64,
    pending: BTreeMap<u64, AckCallback>,
}

impl AckTracker {
    pub fn new() -> Self {
        AckTracker {
            msg_serial: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Next serial that will be assigned
    pub fn msg_serial(&self) -> u64 {
        self.msg_serial
    }

    /// Restore the serial counter from a recovery key
    pub fn set_msg_serial(&mut self, serial: u64) {
        self.msg_serial = serial;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, serial: u64) -> bool {
        self.pending.contains_key(&serial)
    }

    fn alloc_serial(&mut self) -> u64 {
        let serial = self.msg_serial;
        self.msg_serial += 1;
        serial
    }

    /// Assign a serial to a message that requires acknowledgement and record
    /// its callback. Control messages pass through untouched.
    pub fn send_message(&mut self, message: &mut ProtocolMessage, callback: Option<AckCallback>) {
        if !message.requires_ack() {
            return;
        }

        let serial = self.alloc_serial();
        message.msg_serial = Some(serial);
        if let Some(callback) = callback {
            self.pending.insert(serial, callback);
        }
        tracing::trace!("Assigned msgSerial {} ({} pending)", serial, self.pending.len());
    }

    /// Resolve callbacks covered by an Ack/Nack. Returns `true` when the
    /// message was an acknowledgement and needs no further processing.
    pub fn on_message_received(&mut self, message: &ProtocolMessage) -> bool {
        let success = match message.action {
            Action::Ack => true,
            Action::Nack => false,
            _ => return false,
        };

        let Some(range) = message.ack_range() else {
            tracing::warn!("{:?} without msgSerial ignored", message.action);
            return true;
        };

        tracing::debug!(
            "{:?} received for serials {}..={}",
            message.action,
            range.start(),
            range.end()
        );

        // Serials resolved by an earlier acknowledgement are no longer pending
        let covered: Vec<u64> = self.pending.range(range).map(|(serial, _)| *serial).collect();
        for serial in covered {
            let Some(callback) = self.pending.remove(&serial) else {
                continue;
            };
            if success {
                callback(Ok(()));
            } else {
                callback(Err(message.error.clone().unwrap_or_else(ErrorInfo::unknown)));
            }
        }
        true
    }

    /// React to a committed connection state change.
    ///
    /// `resumed` is true when a Connected state continues the previous
    /// connection, in which case serials and pending callbacks survive.
    pub fn on_state_changed(
        &mut self,
        state: ConnectionState,
        error: Option<&ErrorInfo>,
        resumed: bool,
    ) {
        match state {
            ConnectionState::Connected if !resumed => {
                if !self.pending.is_empty() {
                    tracing::info!(
                        "Fresh connection: failing {} unacknowledged messages",
                        self.pending.len()
                    );
                }
                self.fail_all(&ErrorInfo::disconnected());
                self.msg_serial = 0;
            }
            ConnectionState::Closed => {
                self.fail_all(error.unwrap_or(&ErrorInfo::closed()));
            }
            ConnectionState::Failed => {
                self.fail_all(error.unwrap_or(&ErrorInfo::failed()));
            }
            _ => {}
        }
    }

    /// Fail every pending callback with `error` and clear the map
    pub fn fail_all(&mut self, error: &ErrorInfo) {
        let pending = std::mem::take(&mut self.pending);
        for (_, callback) in pending {
            callback(Err(error.clone()));
        }
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AckTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckTracker")
            .field("msg_serial", &self.msg_serial)
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .finish()
    }
}
