//! Hooks applied to every command a client sends, before it is routed.

use async_trait::async_trait;
use gantry_core::command::Command;
use std::sync::Arc;
use tracing::trace;

use crate::listeners::{ListenerId, ListenerList};

#[async_trait]
pub trait MessageInterceptor: Send + Sync {
    /// Returns the command to route, possibly rewritten, or `None` to drop it.
    async fn intercept(&self, command: Command) -> Option<Command>;
}

/// Interceptors shared by every client connection of one endpoint. Applied in
/// registration order; the first interceptor that drops a command ends the chain.
#[derive(Default)]
pub struct MessageInterceptorRegistry {
    interceptors: ListenerList<dyn MessageInterceptor>,
}

impl MessageInterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, interceptor: Arc<dyn MessageInterceptor>) -> ListenerId {
        self.interceptors.add(interceptor).await
    }

    pub async fn remove(&self, id: ListenerId) -> bool {
        self.interceptors.remove(id).await
    }

    pub async fn clear(&self) {
        self.interceptors.clear().await;
    }

    pub async fn len(&self) -> usize {
        self.interceptors.len().await
    }

    pub async fn apply(&self, command: Command) -> Option<Command> {
        let mut current = command;
        for interceptor in self.interceptors.snapshot().await {
            match interceptor.intercept(current).await {
                Some(next) => current = next,
                None => {
                    trace!("client command dropped by interceptor");
                    return None;
                }
            }
        }
        Some(current)
    }
}
