//! Edit pipeline: editing-surface events into store writes.

use folio_core::{reduce, BlockPatch, ChangeEvent, EditKind};

use crate::store::{BlockStore, StoreError};

/// What a committed batch amounted to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Events received
    pub received: usize,
    /// Events left after reduction
    pub reduced: usize,
    /// Store writes performed
    pub applied: usize,
    /// Removals of blocks the store never had
    pub skipped: usize,
}

/// Reduce a batch of edit events and apply what remains.
///
/// Stops at the first storage failure; writes before it stay committed.
pub fn commit_batch<I>(store: &BlockStore, events: I) -> Result<BatchOutcome, StoreError>
where
    I: IntoIterator<Item = ChangeEvent>,
{
    let events: Vec<ChangeEvent> = events.into_iter().collect();
    let received = events.len();
    let reduced = reduce(events);

    let mut outcome = BatchOutcome {
        received,
        reduced: reduced.len(),
        ..BatchOutcome::default()
    };

    for event in reduced {
        match event.kind {
            EditKind::Removed => match store.remove(&event.target) {
                Ok(_) => outcome.applied += 1,
                Err(StoreError::NotFound(id)) => {
                    log::debug!("Skipping removal of unknown block {id}");
                    outcome.skipped += 1;
                }
                Err(e) => return Err(e),
            },
            kind => {
                store.insert_or_merge(to_patch(kind, event))?;
                outcome.applied += 1;
            }
        }
    }

    log::debug!(
        "Committed batch: {} events, {} after reduction, {} applied",
        outcome.received,
        outcome.reduced,
        outcome.applied
    );
    Ok(outcome)
}

fn to_patch(kind: EditKind, event: ChangeEvent) -> BlockPatch {
    let mut patch = BlockPatch::new(event.target);
    patch.index = event.index;
    match kind {
        EditKind::Added => {
            patch.kind = event.block_type;
            patch.data = event.data;
            patch.deleted = Some(false);
        }
        EditKind::Changed => {
            patch.kind = event.block_type;
            patch.data = event.data;
            if event.revives {
                patch.deleted = Some(false);
            }
        }
        EditKind::Moved | EditKind::Removed => {}
    }
    patch
}
