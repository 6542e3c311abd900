use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;

use super::ServerSession;
use crate::bson::Document;

/// A LIFO pool of reusable server sessions.
///
/// Sessions are checked back in at the front and checked out from the front, so that the pool
/// drains from the most recently used session and idle sessions age out at the back.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Checks out a server session from the pool. Sessions that are about to expire according
    /// to the given logical session timeout are discarded along the way. If no reusable
    /// session remains, a new one is created.
    pub(crate) async fn check_out(
        &self,
        logical_session_timeout: Option<Duration>,
    ) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks in a server session to the pool. It will be discarded if it is dirty or about
    /// to expire. Expired sessions at the back of the pool are dropped as well.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().await;
        while let Some(pooled_session) = pool.pop_back() {
            if pooled_session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            pool.push_back(pooled_session);
            break;
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    /// Discards all pooled sessions. Required after a reconnect so that session ids are not
    /// shared across processes.
    pub(crate) async fn clear(&self) {
        self.pool.lock().await.clear();
    }

    /// The ids of all currently pooled sessions, for endSessions on shutdown.
    pub(crate) async fn get_session_ids(&self) -> Vec<Document> {
        self.pool
            .lock()
            .await
            .iter()
            .map(|session| session.id.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: &Document) -> bool {
        self.pool.lock().await.iter().any(|s| &s.id == id)
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.pool.lock().await.len()
    }
}
