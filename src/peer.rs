use anyhow::Result as AnyResult;
use async_trait::async_trait;

use crate::ledger::{Ledger, SharedLedger};

/// A peer's ledger at a given version. `merge_id` is `peer:version`, so
/// pulling an unchanged peer twice is a duplicate merge.
#[derive(Debug, Clone)]
pub struct PeerLedger {
    pub peer_id: String,
    pub version: u64,
    pub ledger: Ledger,
}

impl PeerLedger {
    pub fn merge_id(&self) -> String {
        format!("{}:{}", self.peer_id, self.version)
    }
}

#[async_trait]
pub trait PeerChannel: Send + Sync {
    fn peer_id(&self) -> &str;
    async fn fetch_peer_ledger(&self) -> AnyResult<PeerLedger>;
}

/// Peer living in the same process, read through its shared ledger.
pub struct InProcessPeer {
    peer_id: String,
    ledger: SharedLedger,
}

impl InProcessPeer {
    pub fn new(peer_id: impl Into<String>, ledger: SharedLedger) -> Self {
        Self {
            peer_id: peer_id.into(),
            ledger,
        }
    }
}

#[async_trait]
impl PeerChannel for InProcessPeer {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn fetch_peer_ledger(&self) -> AnyResult<PeerLedger> {
        let ledger = self.ledger.read().clone();
        Ok(PeerLedger {
            peer_id: self.peer_id.clone(),
            version: ledger.version(),
            ledger,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::fingerprint::Context;
    use crate::ledger::MergeOutcome;

    #[tokio::test]
    async fn test_unchanged_peer_merges_once() {
        let remote = Ledger::new(&LedgerConfig::default()).shared();
        remote.write().record("agent-9", &Context::empty(), true);
        let peer = InProcessPeer::new("hive-b", remote.clone());

        let mut local = Ledger::new(&LedgerConfig::default());
        let pulled = peer.fetch_peer_ledger().await.unwrap();
        assert_eq!(pulled.merge_id(), "hive-b:1");
        assert!(matches!(local.merge(&pulled.ledger, &pulled.merge_id()), MergeOutcome::Applied { .. }));

        let again = peer.fetch_peer_ledger().await.unwrap();
        assert_eq!(local.merge(&again.ledger, &again.merge_id()), MergeOutcome::Duplicate);

        remote.write().record("agent-9", &Context::empty(), false);
        let changed = peer.fetch_peer_ledger().await.unwrap();
        assert!(matches!(local.merge(&changed.ledger, &changed.merge_id()), MergeOutcome::Applied { .. }));
    }
}
