//! Client registry
//!
//! Process-wide map from session id to client agent, shared by every
//! handler, the disconnect loop and the query surface without an outer
//! lock.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::client::ClientAgent;
use crate::types::{RoomState, SessionId};

/// Live client agents keyed by session id
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<SessionId, Arc<ClientAgent>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an agent, replacing any previous entry for the same session
    pub fn add(&self, agent: Arc<ClientAgent>) {
        debug!(
            "Client connected, session {} (remote {})",
            agent.id(),
            agent.session.peer()
        );
        self.clients.insert(agent.id(), agent);
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ClientAgent>> {
        self.clients.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Mark the agent offline, then drop it from the map
    pub fn remove(&self, id: SessionId) -> Option<Arc<ClientAgent>> {
        let agent = self.get(id)?;
        agent.state.store(RoomState::Offline);
        self.clients.remove(&id);
        debug!("Client removed, session {}", id);
        Some(agent)
    }

    /// Visit active agents until `visit` returns false.
    ///
    /// Agents whose session is closed or that are logged out are skipped.
    pub fn for_each_active<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<ClientAgent>) -> bool,
    {
        for entry in self.clients.iter() {
            let agent = entry.value();
            if !agent.is_active() {
                continue;
            }
            if !visit(agent) {
                break;
            }
        }
    }

    /// Find the active agent logged in under `user_name`
    ///
    /// Agents that have not logged in yet never match.
    pub fn find_by_name(&self, user_name: &str) -> Option<Arc<ClientAgent>> {
        let mut found = None;
        self.for_each_active(|agent| {
            if agent.has_username() && agent.display_name() == user_name {
                found = Some(Arc::clone(agent));
                false
            } else {
                true
            }
        });
        found
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::connect;
    use crate::session::testing::TestLinks;
    use crate::types::RoomId;

    #[tokio::test]
    async fn test_add_get_remove() {
        let test = TestLinks::new();
        let registry = ClientRegistry::new();
        let conn = connect(&test.links).await;
        let alice = Arc::clone(&conn.agent);
        alice.state.store(RoomState::InRoom(RoomId(1)));

        registry.add(Arc::clone(&alice));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(alice.id()).is_some());

        let removed = registry.remove(alice.id()).unwrap();
        assert!(registry.get(alice.id()).is_none());
        assert!(registry.is_empty());

        // A room still holding the agent sees it as offline
        assert_eq!(removed.room_state(), RoomState::Offline);
        assert_eq!(alice.room_state(), RoomState::Offline);
        assert!(registry.remove(alice.id()).is_none());
    }

    #[tokio::test]
    async fn test_for_each_active_skips_inactive() {
        let test = TestLinks::new();
        let registry = ClientRegistry::new();

        let active = connect(&test.links).await;
        let logged_out = connect(&test.links).await;
        logged_out.agent.state.store(RoomState::Offline);
        let closed = connect(&test.links).await;
        closed.agent.session.close();

        for conn in [&active, &logged_out, &closed] {
            registry.add(Arc::clone(&conn.agent));
        }

        let mut seen = Vec::new();
        registry.for_each_active(|agent| {
            seen.push(agent.id());
            true
        });
        assert_eq!(seen, vec![active.agent.id()]);
    }

    #[tokio::test]
    async fn test_for_each_active_stops_early() {
        let test = TestLinks::new();
        let registry = ClientRegistry::new();
        let mut conns = Vec::new();
        for _ in 0..3 {
            let conn = connect(&test.links).await;
            registry.add(Arc::clone(&conn.agent));
            conns.push(conn);
        }

        let mut visits = 0;
        registry.for_each_active(|_| {
            visits += 1;
            false
        });
        assert_eq!(visits, 1);
    }

    #[tokio::test]
    async fn test_find_by_name() {
        let test = TestLinks::new();
        let registry = ClientRegistry::new();
        let alice = connect(&test.links).await;
        alice.agent.set_username("alice".to_string());
        let other = connect(&test.links).await;
        registry.add(Arc::clone(&alice.agent));
        registry.add(Arc::clone(&other.agent));

        assert_eq!(
            registry.find_by_name("alice").map(|a| a.id()),
            Some(alice.agent.id())
        );
        assert!(registry.find_by_name("bob").is_none());
        assert!(registry.find_by_name("").is_none());
    }
}
