//! Connection State Machine
//!
//! Each state is a variant of [`State`] carrying only the data that state
//! needs. [`State::decide`] is the transition table: it maps a (state, event)
//! pair plus a snapshot of environmental [`Facts`] to a [`Decision`] without
//! touching the connection. The manager commits the decision afterwards.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::error::ErrorInfo;
use crate::protocol::{Action, ConnectionDetails, ProtocolMessage};

/// Public connection state tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Messages published in this state are buffered until Connected
    pub fn can_queue(self) -> bool {
        matches!(
            self,
            ConnectionState::Initialized | ConnectionState::Connecting | ConnectionState::Disconnected
        )
    }

    pub fn can_send(self) -> bool {
        self == ConnectionState::Connected
    }

    /// No automatic transitions leave these states
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event kind on the state-change stream. `Update` marks a Connected
/// message received while already connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    State(ConnectionState),
    Update,
}

/// Published once per committed transition
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub event: ConnectionEvent,
    pub reason: Option<ErrorInfo>,
    pub retry_in: Option<Duration>,
}

/// Data carried by a Disconnected state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPlan {
    pub error: Option<ErrorInfo>,
    /// Filled in by the manager from the backoff policy
    pub retry_in: Option<Duration>,
    pub retry_instantly: bool,
    pub use_fallback_host: bool,
}

/// Connection parameters taken from a `Connected` message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectedInfo {
    pub connection_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_serial: Option<i64>,
    pub details: ConnectionDetails,
    pub error: Option<ErrorInfo>,
}

impl ConnectedInfo {
    pub fn from_message(message: &ProtocolMessage) -> Self {
        ConnectedInfo {
            connection_id: message.connection_id.clone(),
            connection_key: message.resolved_connection_key().map(str::to_string),
            connection_serial: message.connection_serial,
            details: message.connection_details.clone().unwrap_or_default(),
            error: message.error.clone(),
        }
    }
}

/// A connection state together with its per-state data
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Initialized,
    Connecting { use_fallback_host: bool },
    Connected(ConnectedInfo),
    Disconnected(RetryPlan),
    Suspended { error: Option<ErrorInfo>, retry_in: Option<Duration> },
    Closing,
    Closed { error: Option<ErrorInfo> },
    Failed { error: ErrorInfo },
}

/// Input to the transition table
#[derive(Debug, Clone, Copy)]
pub enum StateEvent<'a> {
    Connect,
    Close,
    Message(&'a ProtocolMessage),
    /// Transport closed or errored
    TransportLost(Option<&'a ErrorInfo>),
    /// State timer elapsed
    Timeout,
}

/// Environment consulted by the transition table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Facts {
    pub transport_connected: bool,
    /// Time since the first attempt of this sequence exceeds the state TTL
    pub should_suspend: bool,
    /// Fallback hosts are configured
    pub fallback_available: bool,
    pub can_reach_service: bool,
    pub token_renewable: bool,
    /// A connection key is held, so a reconnect would resume
    pub resumable: bool,
}

impl Facts {
    fn can_use_fallback(&self, error: &ErrorInfo) -> bool {
        self.fallback_available && self.can_reach_service && error.is_retryable()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: State,
    pub clear_connection_key: bool,
}

/// Outcome of [`State::decide`]
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Ignore,
    /// Not a connection-level message; forward to the channel layer
    Unhandled,
    Transition(Transition),
    /// Renew the token, then reconnect (with an error) or reauthorise in band
    RetryAuth(Option<ErrorInfo>),
    /// Connected message received while connected
    Update(ConnectedInfo),
}

impl Decision {
    fn to(next: State) -> Self {
        Decision::Transition(Transition {
            next,
            clear_connection_key: false,
        })
    }

    fn clearing_key(next: State) -> Self {
        Decision::Transition(Transition {
            next,
            clear_connection_key: true,
        })
    }
}

fn is_channel_action(action: Action) -> bool {
    matches!(
        action,
        Action::Attach
            | Action::Attached
            | Action::Detach
            | Action::Detached
            | Action::Presence
            | Action::Message
            | Action::Sync
    )
}

impl State {
    pub fn tag(&self) -> ConnectionState {
        match self {
            State::Initialized => ConnectionState::Initialized,
            State::Connecting { .. } => ConnectionState::Connecting,
            State::Connected(_) => ConnectionState::Connected,
            State::Disconnected(_) => ConnectionState::Disconnected,
            State::Suspended { .. } => ConnectionState::Suspended,
            State::Closing => ConnectionState::Closing,
            State::Closed { .. } => ConnectionState::Closed,
            State::Failed { .. } => ConnectionState::Failed,
        }
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            State::Connected(info) => info.error.as_ref(),
            State::Disconnected(plan) => plan.error.as_ref(),
            State::Suspended { error, .. } | State::Closed { error } => error.as_ref(),
            State::Failed { error } => Some(error),
            State::Initialized | State::Connecting { .. } | State::Closing => None,
        }
    }

    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            State::Disconnected(plan) => plan.retry_in,
            State::Suspended { retry_in, .. } => *retry_in,
            _ => None,
        }
    }

    pub fn can_queue(&self) -> bool {
        self.tag().can_queue()
    }

    pub fn can_send(&self) -> bool {
        self.tag().can_send()
    }

    /// Whether deciding `event` consults `Facts::can_reach_service`
    pub fn needs_reachability(&self, event: &StateEvent<'_>) -> bool {
        match (self, event) {
            (State::Connecting { .. }, StateEvent::Timeout | StateEvent::TransportLost(_)) => true,
            (State::Connecting { .. } | State::Connected(_), StateEvent::Message(msg)) => {
                matches!(msg.action, Action::Error | Action::Disconnected)
            }
            _ => false,
        }
    }

    /// Disconnected, or Suspended once the retry sequence has run too long
    pub(crate) fn disconnected_or_suspended(
        facts: &Facts,
        error: ErrorInfo,
        use_fallback_host: bool,
    ) -> State {
        if facts.should_suspend {
            State::Suspended {
                error: Some(ErrorInfo::suspended().with_cause(error)),
                retry_in: None,
            }
        } else {
            State::Disconnected(RetryPlan {
                error: Some(error),
                use_fallback_host,
                ..Default::default()
            })
        }
    }

    /// The transition table
    pub fn decide(&self, event: &StateEvent<'_>, facts: &Facts) -> Decision {
        match self {
            State::Initialized => match event {
                StateEvent::Connect => Decision::to(State::Connecting {
                    use_fallback_host: false,
                }),
                StateEvent::Message(msg) if is_channel_action(msg.action) => Decision::Unhandled,
                _ => Decision::Ignore,
            },

            State::Connecting { .. } => Self::decide_connecting(event, facts),

            State::Connected(_) => Self::decide_connected(event, facts),

            State::Disconnected(_) | State::Suspended { .. } => match event {
                StateEvent::Connect => Decision::to(State::Connecting {
                    use_fallback_host: false,
                }),
                StateEvent::Close => Decision::to(State::Closed { error: None }),
                StateEvent::Timeout => Decision::to(State::Connecting {
                    use_fallback_host: matches!(
                        self,
                        State::Disconnected(RetryPlan { use_fallback_host: true, .. })
                    ),
                }),
                StateEvent::Message(msg) if is_channel_action(msg.action) => Decision::Unhandled,
                _ => Decision::Ignore,
            },

            State::Closing => match event {
                StateEvent::Connect | StateEvent::Close => Decision::Ignore,
                StateEvent::Message(msg) => match msg.action {
                    Action::Closed => Decision::to(State::Closed { error: None }),
                    Action::Disconnected => Decision::to(State::Disconnected(RetryPlan {
                        error: Some(msg.error.clone().unwrap_or_else(ErrorInfo::disconnected)),
                        ..Default::default()
                    })),
                    Action::Error if msg.channel.is_some() => Decision::Unhandled,
                    Action::Error => Decision::to(State::Failed {
                        error: msg.error.clone().unwrap_or_else(ErrorInfo::failed),
                    }),
                    action if is_channel_action(action) => Decision::Unhandled,
                    _ => Decision::Ignore,
                },
                StateEvent::TransportLost(_) | StateEvent::Timeout => {
                    Decision::to(State::Closed { error: None })
                }
            },

            State::Closed { .. } | State::Failed { .. } => match event {
                StateEvent::Connect => Decision::to(State::Connecting {
                    use_fallback_host: false,
                }),
                _ => Decision::Ignore,
            },
        }
    }

    fn decide_connecting(event: &StateEvent<'_>, facts: &Facts) -> Decision {
        match event {
            StateEvent::Connect => Decision::Ignore,
            StateEvent::Close => Decision::to(State::Closing),
            StateEvent::Message(msg) => match msg.action {
                Action::Connected if facts.transport_connected => {
                    Decision::to(State::Connected(ConnectedInfo::from_message(msg)))
                }
                Action::Connected => {
                    tracing::warn!("Connected message before transport opened, ignoring");
                    Decision::Ignore
                }
                Action::Disconnected => {
                    let error = msg.error.clone().unwrap_or_else(ErrorInfo::disconnected);
                    if error.is_token_error() && facts.token_renewable {
                        return Decision::RetryAuth(Some(error));
                    }
                    let use_fallback = facts.can_use_fallback(&error);
                    Decision::to(Self::disconnected_or_suspended(facts, error, use_fallback))
                }
                Action::Error if msg.channel.is_some() => Decision::Unhandled,
                Action::Error => {
                    let error = msg.error.clone().unwrap_or_else(ErrorInfo::failed);
                    if facts.can_use_fallback(&error) {
                        Decision::clearing_key(State::Disconnected(RetryPlan {
                            error: Some(error),
                            use_fallback_host: true,
                            ..Default::default()
                        }))
                    } else if error.is_token_error() && facts.token_renewable {
                        Decision::RetryAuth(Some(error))
                    } else {
                        Decision::to(State::Failed { error })
                    }
                }
                action if is_channel_action(action) => Decision::Unhandled,
                _ => Decision::Ignore,
            },
            StateEvent::TransportLost(error) => {
                let error = error.cloned().unwrap_or_else(ErrorInfo::disconnected);
                let use_fallback = facts.can_use_fallback(&error);
                Decision::to(Self::disconnected_or_suspended(facts, error, use_fallback))
            }
            StateEvent::Timeout => {
                let use_fallback = facts.fallback_available && facts.can_reach_service;
                Decision::to(Self::disconnected_or_suspended(
                    facts,
                    ErrorInfo::connect_timeout(),
                    use_fallback,
                ))
            }
        }
    }

    fn decide_connected(event: &StateEvent<'_>, facts: &Facts) -> Decision {
        match event {
            StateEvent::Connect => Decision::Ignore,
            StateEvent::Close => Decision::to(State::Closing),
            StateEvent::Message(msg) => match msg.action {
                Action::Connected => Decision::Update(ConnectedInfo::from_message(msg)),
                Action::Disconnected => {
                    let error = msg.error.clone().unwrap_or_else(ErrorInfo::disconnected);
                    if error.is_token_error() && facts.token_renewable {
                        Decision::RetryAuth(Some(error))
                    } else if facts.can_use_fallback(&error) {
                        Decision::clearing_key(State::Disconnected(RetryPlan {
                            error: Some(error),
                            retry_instantly: true,
                            use_fallback_host: true,
                            ..Default::default()
                        }))
                    } else {
                        Decision::to(State::Disconnected(RetryPlan {
                            error: Some(error),
                            ..Default::default()
                        }))
                    }
                }
                // Channel-scoped errors belong to the channel layer
                Action::Error if msg.channel.is_some() => Decision::Unhandled,
                Action::Error => Decision::to(State::Failed {
                    error: msg.error.clone().unwrap_or_else(ErrorInfo::failed),
                }),
                Action::Closed => Decision::to(State::Closed {
                    error: msg.error.clone(),
                }),
                Action::Auth => Decision::RetryAuth(None),
                action if is_channel_action(action) => Decision::Unhandled,
                _ => Decision::Ignore,
            },
            StateEvent::TransportLost(error) => Decision::to(State::Disconnected(RetryPlan {
                error: Some(error.cloned().unwrap_or_else(ErrorInfo::disconnected)),
                retry_instantly: facts.resumable,
                ..Default::default()
            })),
            // Idle timer: nothing heard from the service within the allowed interval
            StateEvent::Timeout => Decision::to(State::Disconnected(RetryPlan {
                error: Some(ErrorInfo::disconnected().with_cause(ErrorInfo::transport(
                    "no activity from service within max idle interval",
                ))),
                retry_instantly: facts.resumable,
                ..Default::default()
            })),
        }
    }
}
