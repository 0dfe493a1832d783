//! Pool of authenticated upstream connections, keyed by parent index.
//!
//! The pool stores idle sockets only; establishing and authenticating new
//! connections is the forwarder's job. The guarding mutex is held across
//! list mutation only, never across I/O.

use std::sync::Mutex;

use tokio::net::TcpStream;

/// Authentication state of a pooled upstream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Connected, no NTLM exchange performed yet.
    Fresh,
    /// A Type-3 round has succeeded on this socket for the bound
    /// credentials.
    Authenticated,
    /// Hit an I/O error or unexpected leftover data; must be closed.
    Dirty,
}

#[derive(Debug)]
pub struct PooledConnection {
    pub stream: TcpStream,
    pub parent: usize,
    pub state: ConnState,
}

#[derive(Debug, Default)]
pub struct ConnectionPool {
    idle: Mutex<Vec<PooledConnection>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an idle authenticated connection for `parent`, if any. A
    /// connection is handed to at most one caller at a time by virtue of
    /// being removed from the list here.
    pub fn lease(&self, parent: usize) -> Option<PooledConnection> {
        let mut idle = self.idle.lock().expect("pool lock");
        let pos = idle
            .iter()
            .position(|c| c.parent == parent && c.state == ConnState::Authenticated)?;
        Some(idle.swap_remove(pos))
    }

    /// Return a connection. `Dirty` connections are dropped (closed);
    /// anything else becomes available for the next lease.
    pub fn release(&self, conn: PooledConnection) {
        if conn.state == ConnState::Dirty {
            return;
        }
        self.idle.lock().expect("pool lock").push(conn);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("pool lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_lease_matches_parent_and_state() {
        let pool = ConnectionPool::new();
        let (a, _keep_a) = socket_pair().await;
        let (b, _keep_b) = socket_pair().await;

        pool.release(PooledConnection {
            stream: a,
            parent: 0,
            state: ConnState::Authenticated,
        });
        pool.release(PooledConnection {
            stream: b,
            parent: 1,
            state: ConnState::Authenticated,
        });

        assert!(pool.lease(2).is_none());
        let conn = pool.lease(1).unwrap();
        assert_eq!(conn.parent, 1);
        assert_eq!(pool.idle_count(), 1);

        // The same socket can never be leased twice concurrently.
        assert!(pool.lease(1).is_none());
    }

    #[tokio::test]
    async fn test_fresh_entries_are_not_leased() {
        let pool = ConnectionPool::new();
        let (a, _keep) = socket_pair().await;
        pool.release(PooledConnection {
            stream: a,
            parent: 0,
            state: ConnState::Fresh,
        });
        assert!(pool.lease(0).is_none());
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_dirty_release_discards() {
        let pool = ConnectionPool::new();
        let (a, _keep) = socket_pair().await;
        pool.release(PooledConnection {
            stream: a,
            parent: 0,
            state: ConnState::Dirty,
        });
        assert_eq!(pool.idle_count(), 0);
    }
}
