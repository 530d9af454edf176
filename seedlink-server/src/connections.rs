//! Registry of active sessions, for INFO CONNECTIONS.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use seedlink_mux_protocol::info::ConnectionEntry;
use seedlink_mux_protocol::{ProtocolVersion, SessionState, Timestamp};

#[derive(Clone, Debug)]
pub(crate) struct ConnectionInfo {
    pub addr: SocketAddr,
    pub connected_at: Timestamp,
    pub protocol_version: ProtocolVersion,
    pub user_agent: Option<String>,
    pub state: SessionState,
}

impl ConnectionInfo {
    pub fn to_entry(&self) -> ConnectionEntry {
        ConnectionEntry {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            ctime: self.connected_at.to_display(),
            proto: self.protocol_version.as_str().to_owned(),
            useragent: self.user_agent.clone(),
            state: self.state.as_str().to_owned(),
        }
    }
}

struct RegistryInner {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, ConnectionInfo>>,
}

/// Thread-safe connection registry. Clone is cheap (Arc).
#[derive(Clone)]
pub(crate) struct ConnectionRegistry(Arc<RegistryInner>);

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self(Arc::new(RegistryInner {
            next_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        }))
    }

    /// Register a new connection. Returns a unique connection ID.
    pub fn register(&self, addr: SocketAddr) -> u64 {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        let info = ConnectionInfo {
            addr,
            connected_at: Timestamp::now(),
            protocol_version: ProtocolVersion::V3,
            user_agent: None,
            state: SessionState::Handshake,
        };
        self.0.connections.lock().unwrap().insert(id, info);
        id
    }

    pub fn unregister(&self, id: u64) {
        self.0.connections.lock().unwrap().remove(&id);
    }

    pub fn update<F>(&self, id: u64, f: F)
    where
        F: FnOnce(&mut ConnectionInfo),
    {
        if let Some(info) = self.0.connections.lock().unwrap().get_mut(&id) {
            f(info);
        }
    }

    /// Entries ordered by connection id.
    pub fn snapshot(&self) -> Vec<ConnectionEntry> {
        let connections = self.0.connections.lock().unwrap();
        let mut ids: Vec<&u64> = connections.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| connections[id].to_entry())
            .collect()
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.0.connections.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn register_and_unregister() {
        let reg = ConnectionRegistry::new();
        let id1 = reg.register(addr(1001));
        let id2 = reg.register(addr(1002));
        assert_eq!(reg.count(), 2);
        assert_ne!(id1, id2);

        reg.unregister(id1);
        reg.unregister(id1);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn snapshot_reflects_updates() {
        let reg = ConnectionRegistry::new();
        reg.register(addr(1001));
        let id = reg.register(addr(1002));
        reg.update(id, |info| {
            info.protocol_version = ProtocolVersion::V4;
            info.user_agent = Some("slink-test/1.0".to_owned());
            info.state = SessionState::Streaming;
        });

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].port, 1001);
        assert_eq!(snap[0].state, "handshake");
        assert_eq!(snap[1].host, "127.0.0.1");
        assert_eq!(snap[1].proto, "4.0");
        assert_eq!(snap[1].useragent.as_deref(), Some("slink-test/1.0"));
        assert_eq!(snap[1].state, "streaming");
    }
}
