//! Commands executed by the workflow loop.
//!
//! Every change to connection state is expressed as a command so that user
//! calls, transport callbacks and timer expiries are totally ordered.

use std::fmt;
use std::time::Duration;

use crate::ack::AckCallback;
use crate::error::ErrorInfo;
use crate::heartbeat::PingCallback;
use crate::protocol::ProtocolMessage;
use crate::transport::TransportEvent;

pub enum RealtimeCommand {
    Connect,
    Close,
    SetConnectingState {
        use_fallback_host: bool,
    },
    SetConnectedState {
        message: ProtocolMessage,
    },
    SetDisconnectedState {
        error: Option<ErrorInfo>,
        retry_instantly: bool,
        use_fallback_host: bool,
        clear_connection_key: bool,
    },
    SetSuspendedState {
        error: Option<ErrorInfo>,
    },
    SetClosingState,
    SetClosedState {
        error: Option<ErrorInfo>,
    },
    SetFailedState {
        error: ErrorInfo,
    },
    /// Renew the token. With an error: reconnect using the new token.
    /// Without: reauthorise the live connection in band.
    RetryAuth {
        error: Option<ErrorInfo>,
    },
    ProcessMessage(ProtocolMessage),
    Ping {
        callback: PingCallback,
    },
    Send {
        message: ProtocolMessage,
        callback: Option<AckCallback>,
    },
    /// Enqueue `command` after `delay` without blocking the loop
    Delay {
        delay: Duration,
        command: Box<RealtimeCommand>,
    },
    HandleTransportEvent {
        transport_id: u64,
        event: TransportEvent,
    },
    /// State timer elapsed; `epoch` identifies the state that armed it
    HandleStateTimeout {
        epoch: u64,
    },
    HandlePingTimeout {
        ping_id: String,
    },
}

impl RealtimeCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RealtimeCommand::Connect => "Connect",
            RealtimeCommand::Close => "Close",
            RealtimeCommand::SetConnectingState { .. } => "SetConnectingState",
            RealtimeCommand::SetConnectedState { .. } => "SetConnectedState",
            RealtimeCommand::SetDisconnectedState { .. } => "SetDisconnectedState",
            RealtimeCommand::SetSuspendedState { .. } => "SetSuspendedState",
            RealtimeCommand::SetClosingState => "SetClosingState",
            RealtimeCommand::SetClosedState { .. } => "SetClosedState",
            RealtimeCommand::SetFailedState { .. } => "SetFailedState",
            RealtimeCommand::RetryAuth { .. } => "RetryAuth",
            RealtimeCommand::ProcessMessage(_) => "ProcessMessage",
            RealtimeCommand::Ping { .. } => "Ping",
            RealtimeCommand::Send { .. } => "Send",
            RealtimeCommand::Delay { .. } => "Delay",
            RealtimeCommand::HandleTransportEvent { .. } => "HandleTransportEvent",
            RealtimeCommand::HandleStateTimeout { .. } => "HandleStateTimeout",
            RealtimeCommand::HandlePingTimeout { .. } => "HandlePingTimeout",
        }
    }

    pub fn disconnected(error: Option<ErrorInfo>) -> Self {
        RealtimeCommand::SetDisconnectedState {
            error,
            retry_instantly: false,
            use_fallback_host: false,
            clear_connection_key: false,
        }
    }

    pub fn delayed(delay: Duration, command: RealtimeCommand) -> Self {
        RealtimeCommand::Delay {
            delay,
            command: Box::new(command),
        }
    }
}

impl fmt::Debug for RealtimeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RealtimeCommand::SetConnectingState { use_fallback_host } => f
                .debug_struct("SetConnectingState")
                .field("use_fallback_host", use_fallback_host)
                .finish(),
            RealtimeCommand::SetDisconnectedState {
                error,
                retry_instantly,
                use_fallback_host,
                clear_connection_key,
            } => f
                .debug_struct("SetDisconnectedState")
                .field("error", error)
                .field("retry_instantly", retry_instantly)
                .field("use_fallback_host", use_fallback_host)
                .field("clear_connection_key", clear_connection_key)
                .finish(),
            RealtimeCommand::SetSuspendedState { error }
            | RealtimeCommand::SetClosedState { error }
            | RealtimeCommand::RetryAuth { error } => {
                f.debug_struct(self.name()).field("error", error).finish()
            }
            RealtimeCommand::SetFailedState { error } => {
                f.debug_struct("SetFailedState").field("error", error).finish()
            }
            RealtimeCommand::SetConnectedState { message } | RealtimeCommand::ProcessMessage(message) => {
                f.debug_struct(self.name()).field("action", &message.action).finish()
            }
            RealtimeCommand::Send { message, callback } => f
                .debug_struct("Send")
                .field("action", &message.action)
                .field("channel", &message.channel)
                .field("has_callback", &callback.is_some())
                .finish(),
            RealtimeCommand::Delay { delay, command } => f
                .debug_struct("Delay")
                .field("delay", delay)
                .field("command", command)
                .finish(),
            RealtimeCommand::HandleTransportEvent {
                transport_id,
                event,
            } => f
                .debug_struct("HandleTransportEvent")
                .field("transport_id", transport_id)
                .field("event", event)
                .finish(),
            RealtimeCommand::HandleStateTimeout { epoch } => f
                .debug_struct("HandleStateTimeout")
                .field("epoch", epoch)
                .finish(),
            RealtimeCommand::HandlePingTimeout { ping_id } => f
                .debug_struct("HandlePingTimeout")
                .field("ping_id", ping_id)
                .finish(),
            RealtimeCommand::Connect
            | RealtimeCommand::Close
            | RealtimeCommand::SetClosingState
            | RealtimeCommand::Ping { .. } => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Action;

    #[test]
    fn test_debug_output() {
        let cmd = RealtimeCommand::ProcessMessage(ProtocolMessage::new(Action::Connected));
        assert_eq!(format!("{:?}", cmd), "ProcessMessage { action: Connected }");

        let cmd = RealtimeCommand::delayed(Duration::from_secs(1), RealtimeCommand::Connect);
        assert_eq!(cmd.name(), "Delay");
        assert!(format!("{:?}", cmd).contains("Connect"));

        let cmd = RealtimeCommand::Send {
            message: ProtocolMessage::message("chan", vec![]),
            callback: None,
        };
        assert!(format!("{:?}", cmd).contains("has_callback: false"));
    }
}
