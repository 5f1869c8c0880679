// Selection and row-expansion state for list views
// Immutable per update: every action produces a new state value

use crate::models::ItemId;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    selected: BTreeSet<ItemId>,
    expanded: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionAction {
    Toggle(ItemId),
    SelectAll(Vec<ItemId>),
    /// Drop selected items that are no longer present in the view
    Retain(Vec<ItemId>),
    Clear,
    ToggleExpanded(String),
    CollapseAll,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_selected(&self, item: &str) -> bool {
        self.selected.contains(item)
    }

    pub fn is_expanded(&self, key: &str) -> bool {
        self.expanded.contains(key)
    }

    /// Selected items in lexicographic order, not view order
    pub fn selected(&self) -> Vec<ItemId> {
        self.selected.iter().cloned().collect()
    }

    pub fn selected_count(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

/// Apply `action` to `state`, returning the next state
pub fn reduce(state: &SelectionState, action: SelectionAction) -> SelectionState {
    let mut next = state.clone();
    match action {
        SelectionAction::Toggle(item) => {
            if !next.selected.remove(&item) {
                next.selected.insert(item);
            }
        }
        SelectionAction::SelectAll(items) => next.selected.extend(items),
        SelectionAction::Retain(visible) => {
            let visible: BTreeSet<ItemId> = visible.into_iter().collect();
            next.selected.retain(|item| visible.contains(item));
        }
        SelectionAction::Clear => next.selected.clear(),
        SelectionAction::ToggleExpanded(key) => {
            if !next.expanded.remove(&key) {
                next.expanded.insert(key);
            }
        }
        SelectionAction::CollapseAll => next.expanded.clear(),
    }
    next
}
