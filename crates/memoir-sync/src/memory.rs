//! Reference [`RemoteLog`] implementation backed by an in-process ring of
//! timestamped bundles. Exists purely for this workspace's own sync tests;
//! a real deployment points `RemoteSyncManager` at an HTTP or object-store
//! backed implementation instead.

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::{EventLogEntry, RemoteLog};

struct Entry {
    accepted_at: DateTime<Utc>,
    bundle: EventLogEntry,
}

#[derive(Default)]
pub struct InMemoryRemoteLog {
    entries: Mutex<Vec<Entry>>,
}

impl InMemoryRemoteLog {
    pub fn new() -> Self {
        InMemoryRemoteLog {
            entries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl RemoteLog for InMemoryRemoteLog {
    async fn save_event_log_entry(&self, entry: EventLogEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;
        // Monotonic per-entry timestamp; a real server stamps on receipt.
        let accepted_at = entries
            .last()
            .map(|e| e.accepted_at + chrono::Duration::milliseconds(1))
            .unwrap_or_else(Utc::now);
        entries.push(Entry { accepted_at, bundle: entry });
        Ok(())
    }

    async fn get_log_entries_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<(Vec<EventLogEntry>, DateTime<Utc>)> {
        let entries = self.entries.lock().await;
        let matching: Vec<EventLogEntry> = entries
            .iter()
            .filter(|e| e.accepted_at > since)
            .map(|e| e.bundle.clone())
            .collect();
        let newest = entries
            .last()
            .map(|e| e.accepted_at)
            .unwrap_or(since);
        Ok((matching, newest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_since_epoch_returns_everything_saved() {
        let log = InMemoryRemoteLog::new();
        log.save_event_log_entry(EventLogEntry::default()).await.unwrap();
        log.save_event_log_entry(EventLogEntry::default()).await.unwrap();

        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let (entries, newest) = log.get_log_entries_since(epoch).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(newest > epoch);
    }

    #[tokio::test]
    async fn entries_since_newest_returns_nothing_new() {
        let log = InMemoryRemoteLog::new();
        log.save_event_log_entry(EventLogEntry::default()).await.unwrap();
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let (_, newest) = log.get_log_entries_since(epoch).await.unwrap();
        let (entries, _) = log.get_log_entries_since(newest).await.unwrap();
        assert!(entries.is_empty());
    }
}
