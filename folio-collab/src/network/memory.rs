//! In-process transport.
//!
//! A [`MemoryHub`] is a switchboard shared by every network on it. Dialing
//! wires two channel pumps between the two peer tables; when either side
//! drops its end, the pump closes the other side too.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use folio_core::ReplicaId;
use tokio::sync::mpsc;

use super::peers::{Outbound, PeerTable};
use super::PeerError;

#[derive(Default)]
struct HubInner {
    members: Mutex<HashMap<ReplicaId, Weak<PeerTable>>>,
    next_link: AtomicU64,
}

/// In-process switchboard for tabs and tests.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHub")
            .field("members", &self.members())
            .finish()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ReplicaId, Weak<PeerTable>>> {
        self.inner
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, table: &Arc<PeerTable>) {
        self.lock()
            .insert(table.local().clone(), Arc::downgrade(table));
    }

    pub(crate) fn unregister(&self, replica: &ReplicaId) {
        self.lock().remove(replica);
    }

    /// Replicas currently reachable through the hub, sorted.
    pub fn members(&self) -> Vec<ReplicaId> {
        let mut members: Vec<ReplicaId> = self
            .lock()
            .iter()
            .filter(|(_, t)| t.strong_count() > 0)
            .map(|(id, _)| id.clone())
            .collect();
        members.sort();
        members
    }

    /// Link `local` with `target`.
    pub(crate) fn dial(&self, local: &Arc<PeerTable>, target: &ReplicaId) {
        // Serializes concurrent dials between the same pair.
        let members = self.lock();

        if target == local.local() {
            local.report(PeerError::Unreachable {
                target: target.to_string(),
                reason: "cannot dial self".into(),
            });
            return;
        }
        if !local.begin_dial(target) {
            log::debug!("{} already connected to {target}", local.local());
            return;
        }
        let Some(remote) = members.get(target).and_then(Weak::upgrade) else {
            local.fail(
                target,
                PeerError::Unreachable {
                    target: target.to_string(),
                    reason: "not on this hub".into(),
                },
            );
            return;
        };

        let link = self.inner.next_link.fetch_add(1, Ordering::Relaxed);
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();

        if !remote.open(local.local().clone(), link, remote_tx) {
            local.abandon_dial(target);
            local.report(PeerError::Transport {
                peer: target.clone(),
                reason: "remote side already holds a link".into(),
            });
            return;
        }
        local.open(target.clone(), link, local_tx);

        tokio::spawn(pump(local_rx, Arc::downgrade(&remote), local.local().clone(), link));
        tokio::spawn(pump(remote_rx, Arc::downgrade(local), target.clone(), link));
    }

    /// Cut the link between `a` and `b`, reporting a transport error on both
    /// sides. Returns `false` when there was no link.
    pub fn sever(&self, a: &ReplicaId, b: &ReplicaId) -> bool {
        let (table_a, table_b) = {
            let members = self.lock();
            (
                members.get(a).and_then(Weak::upgrade),
                members.get(b).and_then(Weak::upgrade),
            )
        };
        let mut severed = false;
        for (table, other) in [(table_a, b), (table_b, a)] {
            let Some(table) = table else { continue };
            if table.close_peer(other) {
                table.report(PeerError::Transport {
                    peer: other.clone(),
                    reason: "link severed".into(),
                });
                severed = true;
            }
        }
        severed
    }
}

/// Move frames from one side's outbound queue into the other side's table.
async fn pump(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    destination: Weak<PeerTable>,
    from: ReplicaId,
    link: u64,
) {
    while let Some(out) = outbound.recv().await {
        let Some(table) = destination.upgrade() else {
            return;
        };
        table.deliver(&from, out.frame);
    }
    // The sending side closed its end.
    if let Some(table) = destination.upgrade() {
        table.close(&from, link);
    }
}
