// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use dashmap::DashMap;
use uuid::Uuid;

use super::Connection;

static NEXT_CLIENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of a client of a multi-client server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        ClientId(value.to_string())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        ClientId(value)
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Generates a client id that is never handed out twice in this process.
///
/// The sequence number makes ids unique within the process; the uuid keeps
/// them from colliding with ids of other server processes.
pub fn new_client_id() -> ClientId {
    let seq = NEXT_CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
    ClientId(format!("{}-{}", seq, Uuid::new_v4().simple()))
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub client_id: ClientId,
    pub connection: Arc<Connection>,
    pub connected_at: DateTime<Local>,
}

impl ClientRecord {
    pub fn new(client_id: ClientId, connection: Arc<Connection>) -> Self {
        ClientRecord {
            client_id,
            connection,
            connected_at: Local::now(),
        }
    }
}

/// Client id to connection map of a multi-client server.
///
/// Written by the accept path and by disconnect notifications, read by every
/// per-client operation; all of them may run concurrently.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    clients: DashMap<ClientId, ClientRecord>,
    retired: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, record: ClientRecord) {
        self.clients.insert(record.client_id.clone(), record);
    }

    /// Removes a record. Its id is retired and never handed out again.
    pub fn remove(&self, client_id: &ClientId) -> Option<ClientRecord> {
        let removed = self.clients.remove(client_id).map(|(_, record)| record);
        if removed.is_some() {
            self.retired.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<Connection>> {
        self.clients
            .get(client_id)
            .map(|record| record.connection.clone())
    }

    pub fn record(&self, client_id: &ClientId) -> Option<ClientRecord> {
        self.clients.get(client_id).map(|record| record.clone())
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn list(&self) -> Vec<ClientId> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of every current record, safe to hold across awaits.
    pub fn records(&self) -> Vec<ClientRecord> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Number of clients that have come and gone.
    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::ConnectionOptions;

    #[test]
    fn test_client_ids_are_unique() {
        let ids: HashSet<ClientId> = (0..10_000).map(|_| new_client_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[tokio::test]
    async fn test_register_and_remove() {
        let registry = ConnectionRegistry::new();
        let (local, _remote) = tokio::io::duplex(64);
        let connection = Arc::new(Connection::new(
            Box::new(local),
            ConnectionOptions::multi_client(),
        ));
        let id = new_client_id();
        registry.register(ClientRecord::new(id.clone(), connection.clone()));

        assert!(registry.contains(&id));
        assert_eq!(registry.list(), vec![id.clone()]);
        assert_eq!(registry.get(&id).unwrap().id(), connection.id());

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.retired(), 1);
    }
}
