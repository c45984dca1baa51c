use tokio::sync::mpsc::UnboundedReceiver;

use crate::page::{NodeId, SharedTree};
use crate::upgrade::UpgradeEngine;
use crate::upload::widen_upload_accept;

/// One batch of subtree insertions, as reported by the host's render layer.
#[derive(Debug, Clone, Default)]
pub struct MutationBatch {
    pub added: Vec<NodeId>,
}

/// Re-runs the upgrade engine and the accept-filter widening over newly
/// inserted subtrees. Work is scoped to the added nodes; the rest of the
/// document is never re-walked on a mutation.
#[derive(Clone)]
pub struct MutationWatcher {
    tree: SharedTree,
    engine: UpgradeEngine,
}

impl MutationWatcher {
    pub fn new(tree: SharedTree, engine: UpgradeEngine) -> Self {
        Self { tree, engine }
    }

    pub fn process(&self, batch: MutationBatch) {
        for added in batch.added {
            if !self.tree.borrow().is_element(added) {
                continue;
            }
            self.engine.upgrade_all(added);
            widen_upload_accept(&mut self.tree.borrow_mut(), added);
        }
    }

    /// Drain mutation batches until the host closes its sender.
    pub async fn run(self, mut batches: UnboundedReceiver<MutationBatch>) {
        while let Some(batch) = batches.recv().await {
            self.process(batch);
        }
    }
}
