//! Change reduction for batched edit events.
//!
//! The editing surface produces a burst of events per tick. Before they reach
//! the block store or the wire, each block id's events are collapsed into the
//! smallest sequence with the same net effect.
//!
//! Each id gets its own stack. Only the top entry is inspected:
//!
//! ```text
//! input \ top │ empty │ Moved │ Added   │ Changed │ Removed
//! ────────────┼───────┼───────┼─────────┼─────────┼─────────
//! Moved       │ push  │ push  │ push    │ push    │ discard
//! Added       │ push  │ push  │ replace │ →Changed│ →Changed
//! Changed     │ push  │ push  │ replace │ replace │ replace
//! Removed     │ push  │ push  │ replace │ replace │ replace
//! ```
//!
//! `→Changed` folds the pair into one `Changed` carrying the final payload:
//! deleting and recreating an id inside one batch looks like an in-place edit
//! from the outside. Such a fold, and any `Changed` replacing an `Added`, is
//! marked as reviving the block. A `Moved` landing on a `Removed` is dropped because the
//! removal wins. Moves are never absorbed by content events above them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::block::{BlockId, Payload};

/// Kind of a single edit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EditKind {
    Moved,
    Added,
    Changed,
    Removed,
}

impl EditKind {
    /// Parse the event name used by the editing surface.
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "block-moved" => Some(Self::Moved),
            "block-added" => Some(Self::Added),
            "block-changed" => Some(Self::Changed),
            "block-removed" => Some(Self::Removed),
            _ => None,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Moved => "block-moved",
            Self::Added => "block-added",
            Self::Changed => "block-changed",
            Self::Removed => "block-removed",
        }
    }
}

/// One edit event for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: EditKind,
    pub target: BlockId,
    pub index: Option<i64>,
    pub data: Option<Payload>,
    /// Block type, when the surface knows it (usually on `Added`).
    pub block_type: Option<String>,
    /// An `Added` was folded into this event, so the block must end up
    /// visible even if the store holds it tombstoned.
    #[serde(default)]
    pub revives: bool,
}

impl ChangeEvent {
    fn new(kind: EditKind, target: impl Into<BlockId>) -> Self {
        Self {
            kind,
            target: target.into(),
            index: None,
            data: None,
            block_type: None,
            revives: false,
        }
    }

    pub fn added(target: impl Into<BlockId>, data: Payload) -> Self {
        Self::new(EditKind::Added, target).with_data(data)
    }

    pub fn changed(target: impl Into<BlockId>, data: Payload) -> Self {
        Self::new(EditKind::Changed, target).with_data(data)
    }

    pub fn removed(target: impl Into<BlockId>) -> Self {
        Self::new(EditKind::Removed, target)
    }

    pub fn moved(target: impl Into<BlockId>, index: i64) -> Self {
        Self::new(EditKind::Moved, target).with_index(index)
    }

    pub fn with_index(mut self, index: i64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_type(mut self, block_type: impl Into<String>) -> Self {
        self.block_type = Some(block_type.into());
        self
    }

    /// Fill fields the newer event leaves unspecified from the event it
    /// supersedes. Removals carry nothing forward.
    fn inherit(mut self, older: &ChangeEvent) -> Self {
        if self.kind == EditKind::Removed {
            return self;
        }
        if self.index.is_none() {
            self.index = older.index;
        }
        if self.data.is_none() {
            self.data = older.data.clone();
        }
        if self.block_type.is_none() {
            self.block_type = older.block_type.clone();
        }
        if self.kind == EditKind::Changed {
            self.revives |= older.revives || older.kind == EditKind::Added;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Push,
    Replace,
    ReplaceAsChanged,
    Discard,
}

fn transition(input: EditKind, top: Option<EditKind>) -> Action {
    use EditKind::*;

    match (input, top) {
        (_, None) | (_, Some(Moved)) => Action::Push,
        (Moved, Some(Removed)) => Action::Discard,
        (Moved, Some(_)) => Action::Push,
        (Added, Some(Changed)) | (Added, Some(Removed)) => Action::ReplaceAsChanged,
        (Added, Some(Added)) => Action::Replace,
        (Changed, Some(_)) | (Removed, Some(_)) => Action::Replace,
    }
}

/// Collapse a chronological batch into its minimal equivalent.
///
/// Ids come out in order of first appearance; each id's surviving events keep
/// their relative order.
pub fn reduce<I>(events: I) -> Vec<ChangeEvent>
where
    I: IntoIterator<Item = ChangeEvent>,
{
    let mut stacks: IndexMap<BlockId, Vec<ChangeEvent>> = IndexMap::new();
    let mut seen = 0usize;

    for event in events {
        seen += 1;
        let stack = stacks.entry(event.target.clone()).or_default();
        let top = stack.last().map(|e| e.kind);

        // Every action except Push implies a non-empty stack.
        match transition(event.kind, top) {
            Action::Push => stack.push(event),
            Action::Replace => {
                if let Some(slot) = stack.last_mut() {
                    *slot = event.inherit(slot);
                }
            }
            Action::ReplaceAsChanged => {
                if let Some(slot) = stack.last_mut() {
                    let mut folded = event.inherit(slot);
                    folded.kind = EditKind::Changed;
                    folded.revives = true;
                    *slot = folded;
                }
            }
            Action::Discard => {
                log::trace!("Dropping move of removed block {}", event.target);
            }
        }
    }

    let reduced: Vec<ChangeEvent> = stacks.into_values().flatten().collect();
    if seen > 0 {
        log::debug!("Reduced {seen} edit events to {}", reduced.len());
    }
    reduced
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(s: &str) -> Payload {
        Payload::from(json!(s))
    }

    fn kinds(events: &[ChangeEvent]) -> Vec<EditKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_repeated_adds_keep_last() {
        let input = (1..=5).map(|i| ChangeEvent::added("1", text(&i.to_string())));
        let out = reduce(input);
        assert_eq!(out, vec![ChangeEvent::added("1", text("5"))]);
    }

    #[test]
    fn test_remove_add_cycles_become_changed() {
        let mut input = Vec::new();
        for i in 1..=5 {
            input.push(ChangeEvent::removed("1"));
            input.push(ChangeEvent::added("1", text(&i.to_string())));
        }
        let out = reduce(input);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EditKind::Changed);
        assert_eq!(out[0].data, Some(text("5")));
        assert!(out[0].revives);
    }

    #[test]
    fn test_changes_then_remove() {
        let mut input: Vec<_> = (1..=5)
            .map(|i| ChangeEvent::changed("1", text(&i.to_string())))
            .collect();
        input.push(ChangeEvent::removed("1"));
        let out = reduce(input);
        assert_eq!(out, vec![ChangeEvent::removed("1")]);
    }

    #[test]
    fn test_move_survives_remove_then_add() {
        let input = vec![
            ChangeEvent::moved("1", 4),
            ChangeEvent::removed("1"),
            ChangeEvent::added("1", text("1")),
        ];
        let out = reduce(input);
        assert_eq!(kinds(&out), vec![EditKind::Moved, EditKind::Changed]);
        assert_eq!(out[0], ChangeEvent::moved("1", 4));
        assert_eq!(out[1].data, Some(text("1")));
    }

    #[test]
    fn test_empty_input() {
        assert!(reduce(Vec::new()).is_empty());
    }

    #[test]
    fn test_remove_onto_move_keeps_both() {
        let out = reduce(vec![ChangeEvent::moved("1", 2), ChangeEvent::removed("1")]);
        assert_eq!(kinds(&out), vec![EditKind::Moved, EditKind::Removed]);
    }

    #[test]
    fn test_move_onto_remove_is_dropped() {
        let out = reduce(vec![ChangeEvent::removed("1"), ChangeEvent::moved("1", 2)]);
        assert_eq!(out, vec![ChangeEvent::removed("1")]);
    }

    #[test]
    fn test_content_never_absorbs_move() {
        let out = reduce(vec![
            ChangeEvent::moved("1", 1),
            ChangeEvent::changed("1", text("a")),
            ChangeEvent::moved("1", 2),
            ChangeEvent::added("1", text("b")),
        ]);
        assert_eq!(
            kinds(&out),
            vec![EditKind::Moved, EditKind::Changed, EditKind::Moved, EditKind::Added]
        );
    }

    #[test]
    fn test_ids_reduced_independently() {
        let out = reduce(vec![
            ChangeEvent::added("a", text("1")),
            ChangeEvent::added("b", text("1")),
            ChangeEvent::changed("a", text("2")),
            ChangeEvent::removed("b"),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].target, BlockId::from("a"));
        assert_eq!(out[0].kind, EditKind::Changed);
        assert_eq!(out[0].data, Some(text("2")));
        assert!(out[0].revives);
        assert_eq!(out[1], ChangeEvent::removed("b"));
    }

    #[test]
    fn test_replace_inherits_type_and_index() {
        let out = reduce(vec![
            ChangeEvent::added("1", text("a")).with_type("code").with_index(3),
            ChangeEvent::changed("1", text("b")),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].block_type.as_deref(), Some("code"));
        assert_eq!(out[0].index, Some(3));
        assert_eq!(out[0].data, Some(text("b")));
    }

    #[test]
    fn test_plain_edits_do_not_revive() {
        let out = reduce(vec![
            ChangeEvent::changed("1", text("a")),
            ChangeEvent::changed("1", text("b")),
        ]);
        assert_eq!(out, vec![ChangeEvent::changed("1", text("b"))]);
        assert!(!out[0].revives);

        // A removal drops any pending revive.
        let out = reduce(vec![
            ChangeEvent::added("1", text("a")),
            ChangeEvent::removed("1"),
        ]);
        assert_eq!(out, vec![ChangeEvent::removed("1")]);
    }

    #[test]
    fn test_event_names() {
        for kind in [EditKind::Moved, EditKind::Added, EditKind::Changed, EditKind::Removed] {
            assert_eq!(EditKind::from_event_name(kind.event_name()), Some(kind));
        }
        assert_eq!(EditKind::from_event_name("block-renamed"), None);
    }
}
