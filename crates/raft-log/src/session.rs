//! Bounded pool of per-reader I/O sessions.
//!
//! A session is just a reusable scratch buffer; each I/O call reopens the
//! target file via its path rather than keeping a long-lived handle per
//! partition, so seek positions never race between sessions. This gets the
//! effect of positional reads without reaching for a platform-specific
//! `pread`.

use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// A rented I/O context: a scratch buffer sized to the coordinator's
/// configured `buffer_size`.
pub struct Session {
    pub buffer: Vec<u8>,
}

impl Session {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer: vec![0u8; buffer_size],
        }
    }
}

/// Fixed-capacity pool of reader sessions. The coordinator's single writer
/// session is held separately and never drawn from this pool.
pub struct SessionPool {
    sessions: Mutex<Vec<Session>>,
    semaphore: Arc<Semaphore>,
    buffer_size: usize,
}

impl SessionPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            sessions: Mutex::new(Vec::with_capacity(capacity)),
            semaphore: Arc::new(Semaphore::new(capacity)),
            buffer_size,
        }
    }

    /// Rents a session, waiting if the pool is at capacity.
    pub async fn open_session(&self) -> SessionGuard<'_> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("session pool semaphore is never closed");
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions.pop().unwrap_or_else(|| Session::new(self.buffer_size))
        };
        SessionGuard {
            pool: self,
            permit: Some(permit),
            session: Some(session),
        }
    }
}

/// A rented [`Session`]; returned to the pool when dropped.
pub struct SessionGuard<'a> {
    pool: &'a SessionPool,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
    session: Option<Session>,
}

impl std::ops::Deref for SessionGuard<'_> {
    type Target = Session;
    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session present until drop")
    }
}

impl std::ops::DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session present until drop")
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Ok(mut sessions) = self.pool.sessions.try_lock() {
                sessions.push(session);
            }
        }
        // Dropping `permit` releases the semaphore slot.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let pool = SessionPool::new(1, 128);
        let _first = pool.open_session().await;
        let second = tokio::time::timeout(std::time::Duration::from_millis(50), pool.open_session())
            .await;
        assert!(second.is_err(), "pool of capacity 1 must block a second renter");
    }

    #[tokio::test]
    async fn session_is_returned_on_drop() {
        let pool = SessionPool::new(1, 64);
        {
            let _s = pool.open_session().await;
        }
        let s = pool.open_session().await;
        assert_eq!(s.buffer.len(), 64);
    }
}
