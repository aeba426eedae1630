use gantry_core::command::{
    Command, CommandKind, ConnectionInfo, ConsumerId, ConsumerInfo, ObjectId, ProducerId,
    ProducerInfo, SessionId, SessionInfo,
};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct SessionState {
    info: SessionInfo,
    consumers: BTreeMap<ConsumerId, ConsumerInfo>,
    producers: BTreeMap<ProducerId, ProducerInfo>,
}

/// The connection, session, consumer and producer objects a client has created,
/// so that a broker joining later can be brought to the same topology.
#[derive(Debug, Default, Clone)]
pub struct ConnectionStateRegister {
    connection: Option<ConnectionInfo>,
    sessions: BTreeMap<SessionId, SessionState>,
}

impl ConnectionStateRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the effect of a client command. Returns whether the register changed.
    pub fn track(&mut self, command: &Command) -> bool {
        match &command.kind {
            CommandKind::ConnectionInfo(info) => {
                self.connection = Some(info.clone());
                true
            }
            CommandKind::SessionInfo(info) => {
                self.sessions.insert(
                    info.session_id.clone(),
                    SessionState {
                        info: info.clone(),
                        consumers: BTreeMap::new(),
                        producers: BTreeMap::new(),
                    },
                );
                true
            }
            CommandKind::ConsumerInfo(info) => match self.sessions.get_mut(&info.consumer_id.session_id) {
                Some(session) => {
                    session.consumers.insert(info.consumer_id.clone(), info.clone());
                    true
                }
                None => {
                    debug!(consumer = %info.consumer_id, "consumer for unknown session ignored");
                    false
                }
            },
            CommandKind::ProducerInfo(info) => match self.sessions.get_mut(&info.producer_id.session_id) {
                Some(session) => {
                    session.producers.insert(info.producer_id.clone(), info.clone());
                    true
                }
                None => {
                    debug!(producer = %info.producer_id, "producer for unknown session ignored");
                    false
                }
            },
            CommandKind::RemoveInfo(object_id) => self.remove(object_id),
            _ => false,
        }
    }

    fn remove(&mut self, object_id: &ObjectId) -> bool {
        match object_id {
            ObjectId::Connection(_) => {
                let changed = self.connection.is_some() || !self.sessions.is_empty();
                self.connection = None;
                self.sessions.clear();
                changed
            }
            ObjectId::Session(session_id) => self.sessions.remove(session_id).is_some(),
            ObjectId::Consumer(consumer_id) => self
                .sessions
                .get_mut(&consumer_id.session_id)
                .map_or(false, |s| s.consumers.remove(consumer_id).is_some()),
            ObjectId::Producer(producer_id) => self
                .sessions
                .get_mut(&producer_id.session_id)
                .map_or(false, |s| s.producers.remove(producer_id).is_some()),
        }
    }

    /// Commands that rebuild the tracked state: the connection first, then each session
    /// followed by its consumers and its producers.
    pub fn replay_commands(&self) -> Vec<Command> {
        let Some(connection) = &self.connection else {
            return Vec::new();
        };

        let mut commands = vec![Command::new(0, CommandKind::ConnectionInfo(connection.clone()))];
        for session in self.sessions.values() {
            commands.push(Command::new(0, CommandKind::SessionInfo(session.info.clone())));
            for consumer in session.consumers.values() {
                commands.push(Command::new(0, CommandKind::ConsumerInfo(consumer.clone())));
            }
            for producer in session.producers.values() {
                commands.push(Command::new(0, CommandKind::ProducerInfo(producer.clone())));
            }
        }
        commands
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
