//! Operation batches compiled from an attribute map
//!
//! [`build`] turns the pending changes of an [`AttributeMap`] into an ordered
//! [`OperationBatch`] and resets the map to "nothing pending". If the server
//! rejects the batch, [`rollback`] replays it backwards to put the changes
//! back, so a retried commit sends the same thing again.
//!
//! Emission order per commit:
//! 1. per attribute: Add-op for added values, then Delete-op for removed
//!    values (`Delta`), or a single Replace-op (`Replaced`)
//! 2. one whole-attribute Delete-op per removed attribute name

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::attributes::AttributeMap;
use super::values::ValueStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModOp {
    Add,
    Delete,
    Replace,
}

/// One modification record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub op: ModOp,
    pub attribute: String,
    /// Empty for a whole-attribute delete
    pub values: Vec<String>,
}

/// Fixed-capacity ordered list of modifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationBatch {
    records: Vec<Modification>,
    capacity: usize,
}

impl OperationBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Upper bound for a map: two ops per attribute plus one per removed name
    pub fn capacity_for(map: &AttributeMap) -> usize {
        2 * map.len() + map.removed_attributes().len()
    }

    pub fn push(&mut self, record: Modification) -> Result<()> {
        if self.records.len() == self.capacity {
            return Err(Error::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.records.push(record);
        Ok(())
    }

    /// Remove the most recently emitted record
    pub fn pop(&mut self) -> Option<Modification> {
        self.records.pop()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Modification> {
        self.records.iter()
    }

    pub fn as_slice(&self) -> &[Modification] {
        &self.records
    }
}

impl<'a> IntoIterator for &'a OperationBatch {
    type Item = &'a Modification;
    type IntoIter = std::slice::Iter<'a, Modification>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Compile the pending changes of `map` into a batch.
///
/// The map is left with nothing pending: sub-lists emptied, every status
/// `Unchanged`, removed-attributes set cleared.
pub fn build(map: &mut AttributeMap) -> Result<OperationBatch> {
    let mut batch = OperationBatch::with_capacity(OperationBatch::capacity_for(map));

    for (name, values) in map.attributes_mut() {
        let current = values.values().to_vec();
        let (status, added, removed) = values.take_changes();
        match status {
            ValueStatus::Unchanged => {}
            ValueStatus::Delta => {
                if !added.is_empty() {
                    batch.push(Modification {
                        op: ModOp::Add,
                        attribute: name.to_string(),
                        values: added,
                    })?;
                }
                if !removed.is_empty() {
                    batch.push(Modification {
                        op: ModOp::Delete,
                        attribute: name.to_string(),
                        values: removed,
                    })?;
                }
            }
            ValueStatus::Replaced => {
                batch.push(Modification {
                    op: ModOp::Replace,
                    attribute: name.to_string(),
                    values: current,
                })?;
            }
        }
    }

    for name in map.take_removed_attributes() {
        batch.push(Modification {
            op: ModOp::Delete,
            attribute: name,
            values: Vec::new(),
        })?;
    }

    debug!(ops = batch.len(), capacity = batch.capacity(), "Built operation batch");
    Ok(batch)
}

/// Replay `batch` backwards into `map`, restoring the pending changes a
/// failed commit had taken.
///
/// Records are popped from the tail until the batch is empty. Local edits
/// made while the batch was in flight are kept: restored deltas cancel
/// against them where they overlap.
pub fn rollback(batch: &mut OperationBatch, map: &mut AttributeMap) -> Result<()> {
    debug!(ops = batch.len(), "Rolling back operation batch");

    while let Some(record) = batch.pop() {
        match record.op {
            ModOp::Delete if record.values.is_empty() => {
                map.restore_removed_attribute(&record.attribute)
            }
            ModOp::Delete => match map.get_mut(&record.attribute) {
                Some(values) => values.restore_removed(&record.values)?,
                None => skip_vanished(&record),
            },
            ModOp::Add => match map.get_mut(&record.attribute) {
                Some(values) => values.restore_added(&record.values)?,
                None => skip_vanished(&record),
            },
            ModOp::Replace => match map.get_mut(&record.attribute) {
                Some(values) => values.mark_replaced(),
                None => skip_vanished(&record),
            },
        }
    }

    Ok(())
}

/// The attribute was deleted locally after submission; its removal is
/// already pending (or it was never on the server), so there is nothing to
/// restore.
fn skip_vanished(record: &Modification) {
    warn!(
        attribute = %record.attribute,
        op = ?record.op,
        "Attribute removed while commit was in flight, skipping rollback record"
    );
}
