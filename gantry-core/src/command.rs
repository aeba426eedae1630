use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use crate::destination::Destination;

// Ids are hierarchical: a session id knows its connection, a consumer or producer id
// knows its session. This is what lets the connection state register find the
// owner of every object when a RemoveInfo arrives.

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub connection_id: ConnectionId,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId {
    pub session_id: SessionId,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId {
    pub session_id: SessionId,
    pub value: u64,
}

impl ConnectionId {
    pub fn new(value: impl Into<String>) -> Self {
        ConnectionId(value.into())
    }

    pub fn session(&self, value: u64) -> SessionId {
        SessionId {
            connection_id: self.clone(),
            value,
        }
    }
}

impl SessionId {
    pub fn consumer(&self, value: u64) -> ConsumerId {
        ConsumerId {
            session_id: self.clone(),
            value,
        }
    }

    pub fn producer(&self, value: u64) -> ProducerId {
        ProducerId {
            session_id: self.clone(),
            value,
        }
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.value)
    }
}

impl Display for ConsumerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.value)
    }
}

impl Display for ProducerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.value)
    }
}

/// Target of a `RemoveInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectId {
    Connection(ConnectionId),
    Session(SessionId),
    Consumer(ConsumerId),
    Producer(ProducerId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub client_id: Option<String>,
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub selector: Option<String>,
    pub prefetch_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    /// `None` for anonymous producers that name the destination per message.
    pub destination: Option<Destination>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub producer_id: Option<ProducerId>,
    pub destination: Destination,
    pub payload: Vec<u8>,
    pub properties: HashMap<String, String>,
    pub persistent: bool,
}

impl Message {
    pub fn new(message_id: impl Into<String>, destination: Destination, payload: Vec<u8>) -> Self {
        Message {
            message_id: message_id.into(),
            producer_id: None,
            destination,
            payload,
            properties: HashMap::new(),
            persistent: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub last_message_id: String,
    pub message_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDispatch {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFormatInfo {
    pub version: u32,
    pub cache_enabled: bool,
    pub max_inactivity_duration_ms: u64,
}

impl Default for WireFormatInfo {
    fn default() -> Self {
        WireFormatInfo {
            version: 1,
            cache_enabled: false,
            max_inactivity_duration_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    ConnectionInfo(ConnectionInfo),
    SessionInfo(SessionInfo),
    ConsumerInfo(ConsumerInfo),
    ProducerInfo(ProducerInfo),
    RemoveInfo(ObjectId),
    Message(Message),
    MessageAck(MessageAck),
    MessageDispatch(MessageDispatch),
    KeepAliveInfo,
    WireFormatInfo(WireFormatInfo),
    ShutdownInfo,
    Response { correlation_id: u32 },
    ExceptionResponse { correlation_id: u32, message: String },
}

/// One protocol command as it travels between a client, the control plane and a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: u32,
    pub response_required: bool,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(command_id: u32, kind: CommandKind) -> Self {
        Command {
            command_id,
            response_required: false,
            kind,
        }
    }

    pub fn with_response_required(mut self) -> Self {
        self.response_required = true;
        self
    }

    pub fn response(correlation_id: u32) -> Self {
        Command::new(0, CommandKind::Response { correlation_id })
    }

    pub fn exception(correlation_id: u32, message: impl Into<String>) -> Self {
        Command::new(
            0,
            CommandKind::ExceptionResponse {
                correlation_id,
                message: message.into(),
            },
        )
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::Response { .. } | CommandKind::ExceptionResponse { .. }
        )
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.kind, CommandKind::ExceptionResponse { .. })
    }

    pub fn correlation_id(&self) -> Option<u32> {
        match self.kind {
            CommandKind::Response { correlation_id }
            | CommandKind::ExceptionResponse { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }

    /// The destination a command is bound to, when it is bound to exactly one.
    pub fn destination(&self) -> Option<&Destination> {
        match &self.kind {
            CommandKind::Message(message) => Some(&message.destination),
            CommandKind::MessageAck(ack) => Some(&ack.destination),
            CommandKind::MessageDispatch(dispatch) => Some(&dispatch.destination),
            CommandKind::ConsumerInfo(info) => Some(&info.destination),
            CommandKind::ProducerInfo(info) => info.destination.as_ref(),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            CommandKind::ConnectionInfo(_) => "ConnectionInfo",
            CommandKind::SessionInfo(_) => "SessionInfo",
            CommandKind::ConsumerInfo(_) => "ConsumerInfo",
            CommandKind::ProducerInfo(_) => "ProducerInfo",
            CommandKind::RemoveInfo(_) => "RemoveInfo",
            CommandKind::Message(_) => "Message",
            CommandKind::MessageAck(_) => "MessageAck",
            CommandKind::MessageDispatch(_) => "MessageDispatch",
            CommandKind::KeepAliveInfo => "KeepAliveInfo",
            CommandKind::WireFormatInfo(_) => "WireFormatInfo",
            CommandKind::ShutdownInfo => "ShutdownInfo",
            CommandKind::Response { .. } => "Response",
            CommandKind::ExceptionResponse { .. } => "ExceptionResponse",
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}(id: {}", self.name(), self.command_id)?;
        if let Some(destination) = self.destination() {
            write!(f, ", destination: {}", destination)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_of_bound_commands() {
        let queue = Destination::queue("orders");
        let message = Command::new(
            7,
            CommandKind::Message(Message::new("m-1", queue.clone(), b"x".to_vec())),
        );
        assert_eq!(message.destination(), Some(&queue));

        let session = ConnectionId::new("c1").session(1);
        let anonymous = Command::new(
            8,
            CommandKind::ProducerInfo(ProducerInfo {
                producer_id: session.producer(1),
                destination: None,
            }),
        );
        assert_eq!(anonymous.destination(), None);
    }

    #[test]
    fn responses_carry_correlation() {
        let ok = Command::response(42);
        assert!(ok.is_response());
        assert!(!ok.is_exception());
        assert_eq!(ok.correlation_id(), Some(42));

        let failed = Command::exception(43, "stopped");
        assert!(failed.is_exception());
        assert_eq!(failed.correlation_id(), Some(43));
    }

    #[test]
    fn ids_know_their_parents() {
        let connection = ConnectionId::new("c1");
        let consumer = connection.session(2).consumer(3);
        assert_eq!(consumer.session_id.connection_id, connection);
        assert_eq!(consumer.to_string(), "c1:2:3");
    }
}
