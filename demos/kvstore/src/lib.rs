//! A sample in-memory key/value [`StateMachine`] built on `openreplica`.

use std::collections::BTreeMap;

use openreplica::session::SessionId;
use openreplica::state_machine::ApplyContext;
use openreplica::state_machine::StateMachine;
use serde::Deserialize;
use serde::Serialize;

/// The operations a client may submit, serialized as a command's opaque payload bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
    /// Set `key`, and publish an event to every session watching it.
    SetAndNotify { key: String, value: String, watchers: Vec<SessionId> },
}

/// Read-only lookups, answered without going through the log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Query {
    Get { key: String },
    Keys,
}

#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),
}

/// The state machine itself: an ordered map, snapshotted wholesale as JSON.
#[derive(Default)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for KvStore {
    fn apply_command(&mut self, _session: SessionId, _sequence: u64, payload: &[u8], ctx: &mut ApplyContext) -> Result<Vec<u8>, String> {
        let cmd: Command = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        match cmd {
            Command::Set { key, value } => {
                self.data.insert(key, value);
                Ok(Vec::new())
            }
            Command::Delete { key } => {
                self.data.remove(&key);
                Ok(Vec::new())
            }
            Command::SetAndNotify { key, value, watchers } => {
                self.data.insert(key.clone(), value.clone());
                for watcher in watchers {
                    ctx.publish(watcher, "kvstore", serde_json::to_vec(&(key.clone(), value.clone())).expect("tuple serialization cannot fail"));
                }
                Ok(Vec::new())
            }
        }
    }

    fn apply_query(&self, _session: SessionId, payload: &[u8]) -> Result<Vec<u8>, String> {
        let query: Query = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        match query {
            Query::Get { key } => match self.data.get(&key) {
                Some(value) => Ok(serde_json::to_vec(value).expect("string serialization cannot fail")),
                None => Err(KvError::NotFound(key).to_string()),
            },
            Query::Keys => Ok(serde_json::to_vec(&self.data.keys().cloned().collect::<Vec<_>>()).expect("vec serialization cannot fail")),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(&self.data).expect("map serialization cannot fail")
    }

    fn restore(&mut self, bytes: &[u8]) {
        self.data = serde_json::from_slice(bytes).unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ApplyContext {
        ApplyContext::default()
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut kv = KvStore::new();
        let mut c = ctx();
        kv.apply_command(1, 1, &serde_json::to_vec(&Command::Set { key: "a".into(), value: "1".into() }).unwrap(), &mut c).unwrap();
        let got = kv.apply_query(1, &serde_json::to_vec(&Query::Get { key: "a".into() }).unwrap()).unwrap();
        assert_eq!(serde_json::from_slice::<String>(&got).unwrap(), "1");
    }

    #[test]
    fn delete_removes_key() {
        let mut kv = KvStore::new();
        let mut c = ctx();
        kv.apply_command(1, 1, &serde_json::to_vec(&Command::Set { key: "a".into(), value: "1".into() }).unwrap(), &mut c).unwrap();
        kv.apply_command(1, 2, &serde_json::to_vec(&Command::Delete { key: "a".into() }).unwrap(), &mut c).unwrap();
        let err = kv.apply_query(1, &serde_json::to_vec(&Query::Get { key: "a".into() }).unwrap()).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn snapshot_round_trips_through_restore() {
        let mut kv = KvStore::new();
        let mut c = ctx();
        kv.apply_command(1, 1, &serde_json::to_vec(&Command::Set { key: "a".into(), value: "1".into() }).unwrap(), &mut c).unwrap();
        let bytes = kv.snapshot();
        let mut restored = KvStore::new();
        restored.restore(&bytes);
        let got = restored.apply_query(1, &serde_json::to_vec(&Query::Get { key: "a".into() }).unwrap()).unwrap();
        assert_eq!(serde_json::from_slice::<String>(&got).unwrap(), "1");
    }

    #[test]
    fn set_and_notify_publishes_event_to_each_watcher() {
        let mut kv = KvStore::new();
        let mut c = ctx();
        kv.apply_command(
            1,
            1,
            &serde_json::to_vec(&Command::SetAndNotify {
                key: "a".into(),
                value: "1".into(),
                watchers: vec![2, 3],
            })
            .unwrap(),
            &mut c,
        )
        .unwrap();
        assert_eq!(c.published.len(), 2);
        assert_eq!(c.published[0].session, 2);
        assert_eq!(c.published[1].session, 3);
    }
}
