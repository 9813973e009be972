//! Case-insensitive attribute map with change tracking
//!
//! Directory entries carry a handful of attributes, so the map is an ordered
//! association list with linear, case-insensitive lookup. Iteration follows
//! insertion order; the first spelling of a name is kept.

use crate::error::Result;

use super::batch::{ModOp, OperationBatch};
use super::eq_fold;
use super::values::ValueList;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attribute {
    name: String,
    values: ValueList,
    /// Added client-side and never committed
    local: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeMap {
    attributes: Vec<Attribute>,
    /// Names deleted since the last commit
    removed: Vec<String>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map materialized from a server search result; nothing is pending.
    pub fn from_server<I, N, V, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = Self::new();
        for (name, values) in attributes {
            let name = name.into();
            let values = ValueList::from_server(values);
            match map.index_of(&name) {
                // duplicate names in a server result: later spelling wins
                Some(i) => map.attributes[i].values = values,
                None => map.attributes.push(Attribute {
                    name,
                    values,
                    local: false,
                }),
            }
        }
        map
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&ValueList> {
        self.index_of(name).map(|i| &self.attributes[i].values)
    }

    /// Mutable access for incremental edits (`append`, `remove`, ...).
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ValueList> {
        self.index_of(name).map(move |i| &mut self.attributes[i].values)
    }

    /// Whether the attribute was created client-side and never committed
    pub fn is_local(&self, name: &str) -> bool {
        self.index_of(name)
            .map(|i| self.attributes[i].local)
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ValueList)> {
        self.attributes
            .iter()
            .map(|a| (a.name.as_str(), &a.values))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    /// Names deleted since the last commit, in deletion order
    pub fn removed_attributes(&self) -> &[String] {
        &self.removed
    }

    /// Whether a commit would send anything
    pub fn has_changes(&self) -> bool {
        !self.removed.is_empty() || self.attributes.iter().any(|a| a.values.has_changes())
    }

    /// Assign all values of an attribute.
    ///
    /// An existing attribute is replaced wholesale. A new one records every
    /// value as added, unless the name was deleted earlier in this session:
    /// the server still holds the old values then, so the new list replaces
    /// them.
    pub fn set<I, S>(&mut self, name: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(i) = self.index_of(name) {
            return self.attributes[i].values.replace_all(values);
        }

        // values are checked before the pending delete is touched
        let replacement = {
            let mut list = ValueList::new();
            list.replace_all(values)?;
            list
        };

        let attribute = match self.take_removed(name) {
            Some(removed_name) => Attribute {
                name: removed_name,
                values: replacement,
                local: false,
            },
            None => Attribute {
                name: name.to_string(),
                values: ValueList::with_added(replacement.values().iter().cloned())?,
                local: true,
            },
        };
        self.attributes.push(attribute);
        Ok(())
    }

    /// Delete an attribute and return its values.
    ///
    /// Committed attributes are remembered in the removed-attributes set so
    /// the next commit deletes them server-side; purely local ones are just
    /// dropped.
    pub fn remove(&mut self, name: &str) -> Option<ValueList> {
        let index = self.index_of(name)?;
        let attribute = self.attributes.remove(index);
        if !attribute.local && !self.removed.iter().any(|r| eq_fold(r, name)) {
            self.removed.push(attribute.name);
        }
        Some(attribute.values)
    }

    /// Clear the `local` flag of every attribute a committed batch created.
    pub fn mark_committed(&mut self, batch: &OperationBatch) {
        for record in batch.iter() {
            if matches!(record.op, ModOp::Add | ModOp::Replace) {
                if let Some(i) = self.index_of(&record.attribute) {
                    self.attributes[i].local = false;
                }
            }
        }
    }

    // =========================================================================
    // Batch build / rollback support
    // =========================================================================

    pub(crate) fn attributes_mut(&mut self) -> impl Iterator<Item = (&str, &mut ValueList)> {
        self.attributes
            .iter_mut()
            .map(|a| (a.name.as_str(), &mut a.values))
    }

    pub(crate) fn take_removed_attributes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.removed)
    }

    /// Undo a whole-attribute delete that failed.
    ///
    /// Absent names are re-queued ahead of newer deletes. A name re-set while
    /// the delete was in flight still has its old values on the server, so
    /// the live list is turned into a replace.
    pub(crate) fn restore_removed_attribute(&mut self, name: &str) {
        match self.index_of(name) {
            Some(i) => {
                let attribute = &mut self.attributes[i];
                attribute.values.mark_replaced();
                attribute.local = false;
            }
            None => {
                if !self.removed.iter().any(|r| eq_fold(r, name)) {
                    self.removed.insert(0, name.to_string());
                }
            }
        }
    }

    /// Drop `name` from the pending deletes, returning the spelling it had
    fn take_removed(&mut self, name: &str) -> Option<String> {
        let pos = self.removed.iter().position(|r| eq_fold(r, name))?;
        Some(self.removed.remove(pos))
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| eq_fold(&a.name, name))
    }
}
