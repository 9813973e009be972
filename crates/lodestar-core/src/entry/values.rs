//! Multi-valued attribute list with change tracking
//!
//! A [`ValueList`] keeps the live values of one attribute together with the
//! values added and removed since the last commit. A value is never recorded
//! in both `added` and `removed`: recording it on one side cancels a pending
//! entry on the other side instead.

use std::ops::{Bound, RangeBounds};

use crate::error::{Error, Result};

use super::eq_fold;

/// Change status of a value list since the last commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueStatus {
    /// Nothing to send
    #[default]
    Unchanged,
    /// Incremental adds/removes recorded in `added` and `removed`
    Delta,
    /// The whole list must be sent as a replace
    Replaced,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueList {
    values: Vec<String>,
    added: Vec<String>,
    removed: Vec<String>,
    status: ValueStatus,
}

impl ValueList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values as they exist on the server; status is `Unchanged`.
    ///
    /// Servers never return duplicates, but case-variants are collapsed
    /// anyway so the uniqueness invariant holds from the start.
    pub fn from_server<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::new();
        for value in values {
            let value = value.into();
            if !list.contains(&value) {
                list.values.push(value);
            }
        }
        list
    }

    /// Values for an attribute created client-side: every value is pending.
    pub fn with_added<I, S>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::new();
        list.extend(values)?;
        Ok(list)
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn added(&self) -> &[String] {
        &self.added
    }

    pub fn removed(&self) -> &[String] {
        &self.removed
    }

    pub fn status(&self) -> ValueStatus {
        self.status
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn first(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.values.iter()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.position(value).is_some()
    }

    pub fn position(&self, value: &str) -> Option<usize> {
        self.values.iter().position(|v| eq_fold(v, value))
    }

    /// Whether anything has to be sent for this list on the next commit
    pub fn has_changes(&self) -> bool {
        self.status != ValueStatus::Unchanged
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    pub fn append(&mut self, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        if self.contains(&value) {
            return Err(Error::DuplicateValue(value));
        }
        self.values.push(value.clone());
        self.record_added(value);
        Ok(())
    }

    /// Append several values; nothing is appended if any of them is a duplicate.
    pub fn extend<I, S>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = Self::check_unique(values, &self.values)?;
        for value in values {
            self.values.push(value.clone());
            self.record_added(value);
        }
        Ok(())
    }

    /// Insert at `index`, clamped to the end of the list.
    pub fn insert(&mut self, index: usize, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        if self.contains(&value) {
            return Err(Error::DuplicateValue(value));
        }
        let index = index.min(self.values.len());
        self.values.insert(index, value.clone());
        self.record_added(value);
        Ok(())
    }

    /// Remove a value (matched case-insensitively) and return the stored spelling.
    pub fn remove(&mut self, value: &str) -> Result<String> {
        let index = self
            .position(value)
            .ok_or_else(|| Error::ValueNotFound(value.to_string()))?;
        let removed = self.values.remove(index);
        self.record_removed(removed.clone());
        Ok(removed)
    }

    /// Remove and return the value at `index`.
    pub fn pop(&mut self, index: usize) -> Option<String> {
        if index >= self.values.len() {
            return None;
        }
        let removed = self.values.remove(index);
        self.record_removed(removed.clone());
        Some(removed)
    }

    /// Remove every value, one delta per value.
    pub fn clear(&mut self) {
        let values = std::mem::take(&mut self.values);
        for value in values {
            self.record_removed(value);
        }
    }

    /// Replace the values in `range` with `values`.
    ///
    /// A range covering the whole list is a bulk replace and marks the list
    /// `Replaced`; a partial range records removed and added deltas.
    pub fn set_slice<R, I, S>(&mut self, range: R, values: I) -> Result<()>
    where
        R: RangeBounds<usize>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let len = self.values.len();
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s + 1,
            Bound::Unbounded => 0,
        }
        .min(len);
        let end = match range.end_bound() {
            Bound::Included(&e) => e + 1,
            Bound::Excluded(&e) => e,
            Bound::Unbounded => len,
        }
        .clamp(start, len);

        let mut kept = self.values[..start].to_vec();
        kept.extend_from_slice(&self.values[end..]);
        let incoming = Self::check_unique(values, &kept)?;

        if start == 0 && end == len {
            self.values = incoming;
            self.added.clear();
            self.removed.clear();
            self.status = ValueStatus::Replaced;
            return Ok(());
        }

        let outgoing: Vec<String> = self
            .values
            .splice(start..end, incoming.iter().cloned())
            .collect();
        for value in outgoing {
            self.record_removed(value);
        }
        for value in incoming {
            self.record_added(value);
        }
        Ok(())
    }

    /// Replace the whole list; equivalent to a full-range `set_slice`.
    pub fn replace_all<I, S>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_slice(.., values)
    }

    // =========================================================================
    // Commit bookkeeping
    // =========================================================================

    /// Hand the pending deltas to the batch builder and reset to `Unchanged`.
    pub(crate) fn take_changes(&mut self) -> (ValueStatus, Vec<String>, Vec<String>) {
        let status = std::mem::take(&mut self.status);
        let added = std::mem::take(&mut self.added);
        let removed = std::mem::take(&mut self.removed);
        (status, added, removed)
    }

    pub(crate) fn mark_replaced(&mut self) {
        self.added.clear();
        self.removed.clear();
        self.status = ValueStatus::Replaced;
    }

    /// Put back values of a failed Add-op, ahead of deltas recorded since.
    pub(crate) fn restore_added(&mut self, values: &[String]) -> Result<()> {
        if self.status == ValueStatus::Replaced {
            return Ok(());
        }
        let mut at = 0;
        for value in values {
            if let Some(pos) = self.removed.iter().position(|v| eq_fold(v, value)) {
                // removed locally after submission: the two cancel out
                self.removed.remove(pos);
            } else if self.contains(value) {
                self.added.insert(at, value.clone());
                at += 1;
            } else {
                return Err(Error::InconsistentState(format!(
                    "added value {:?} is neither present nor recorded as removed",
                    value
                )));
            }
        }
        self.settle();
        Ok(())
    }

    /// Put back values of a failed Delete-op, ahead of deltas recorded since.
    pub(crate) fn restore_removed(&mut self, values: &[String]) -> Result<()> {
        if self.status == ValueStatus::Replaced {
            return Ok(());
        }
        let mut at = 0;
        for value in values {
            if let Some(pos) = self.added.iter().position(|v| eq_fold(v, value)) {
                // re-added locally after submission
                self.added.remove(pos);
            } else if !self.contains(value) {
                self.removed.insert(at, value.clone());
                at += 1;
            } else {
                return Err(Error::InconsistentState(format!(
                    "removed value {:?} is present but not recorded as added",
                    value
                )));
            }
        }
        self.settle();
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn record_added(&mut self, value: String) {
        if self.status == ValueStatus::Replaced {
            return;
        }
        match self.removed.iter().position(|v| eq_fold(v, &value)) {
            Some(pos) => {
                self.removed.remove(pos);
            }
            None => self.added.push(value),
        }
        self.settle();
    }

    fn record_removed(&mut self, value: String) {
        if self.status == ValueStatus::Replaced {
            return;
        }
        match self.added.iter().position(|v| eq_fold(v, &value)) {
            Some(pos) => {
                self.added.remove(pos);
            }
            None => self.removed.push(value),
        }
        self.settle();
    }

    /// `Delta` with an empty net delta has nothing to send.
    fn settle(&mut self) {
        self.status = if self.added.is_empty() && self.removed.is_empty() {
            ValueStatus::Unchanged
        } else {
            ValueStatus::Delta
        };
    }

    /// Collect `values`, rejecting any that collide with `existing` or with
    /// each other.
    fn check_unique<I, S>(values: I, existing: &[String]) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for value in values {
            let value = value.into();
            if existing.iter().chain(out.iter()).any(|v| eq_fold(v, &value)) {
                return Err(Error::DuplicateValue(value));
            }
            out.push(value);
        }
        Ok(out)
    }
}

impl<'a> IntoIterator for &'a ValueList {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn server(values: &[&str]) -> ValueList {
        ValueList::from_server(values.iter().copied())
    }

    #[test]
    fn test_append_records_delta() {
        let mut cn = server(&["Bob"]);
        cn.append("Robert").unwrap();

        assert_eq!(cn.status(), ValueStatus::Delta);
        assert_eq!(cn.added(), ["Robert"]);
        assert_eq!(cn.values(), ["Bob", "Robert"]);
    }

    #[test]
    fn test_duplicate_is_case_insensitive() {
        let mut mail = server(&["a@x.com"]);
        let err = mail.append("A@X.COM").unwrap_err();
        assert!(matches!(err, Error::DuplicateValue(_)));
        assert_eq!(mail.status(), ValueStatus::Unchanged);
    }

    #[test]
    fn test_extend_is_all_or_nothing() {
        let mut list = server(&["a"]);
        assert!(list.extend(["b", "c", "B"]).is_err());
        assert_eq!(list.values(), ["a"]);
        assert!(list.added().is_empty());
    }

    #[test]
    fn test_remove_then_readd_cancels() {
        let mut list = server(&["a", "b"]);
        list.remove("A").unwrap();
        assert_eq!(list.removed(), ["a"]);

        list.append("a").unwrap();
        assert!(list.removed().is_empty());
        assert!(list.added().is_empty());
        assert_eq!(list.status(), ValueStatus::Unchanged);
    }

    #[test]
    fn test_remove_missing_value() {
        let mut list = server(&["a"]);
        assert!(matches!(list.remove("z"), Err(Error::ValueNotFound(_))));
    }

    #[test]
    fn test_insert_clamps_index() {
        let mut list = server(&["a"]);
        list.insert(10, "b").unwrap();
        list.insert(0, "c").unwrap();
        assert_eq!(list.values(), ["c", "a", "b"]);
    }

    #[test]
    fn test_full_slice_replaces() {
        let mut list = server(&["a", "b"]);
        list.append("c").unwrap();
        list.set_slice(.., ["x", "y"]).unwrap();

        assert_eq!(list.status(), ValueStatus::Replaced);
        assert!(list.added().is_empty());
        assert!(list.removed().is_empty());
        assert_eq!(list.values(), ["x", "y"]);

        // further edits stay folded into the replace
        list.append("z").unwrap();
        assert_eq!(list.status(), ValueStatus::Replaced);
        assert!(list.added().is_empty());
    }

    #[test]
    fn test_partial_slice_records_both_sides() {
        let mut list = server(&["a", "b", "c"]);
        list.set_slice(1..2, ["x"]).unwrap();

        assert_eq!(list.values(), ["a", "x", "c"]);
        assert_eq!(list.added(), ["x"]);
        assert_eq!(list.removed(), ["b"]);
        assert_eq!(list.status(), ValueStatus::Delta);
    }

    #[test]
    fn test_partial_slice_may_reuse_replaced_values() {
        let mut list = server(&["a", "b", "c"]);
        list.set_slice(0..2, ["B", "d"]).unwrap();
        assert_eq!(list.values(), ["B", "d", "c"]);
        assert!(list.set_slice(0..1, ["c"]).is_err());
    }

    #[test]
    fn test_clear_records_every_value() {
        let mut list = server(&["a", "b"]);
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.removed(), ["a", "b"]);
    }

    #[test]
    fn test_pop() {
        let mut list = server(&["a", "b"]);
        assert_eq!(list.pop(1).as_deref(), Some("b"));
        assert_eq!(list.pop(5), None);
        assert_eq!(list.removed(), ["b"]);
    }

    #[derive(Debug, Clone)]
    enum Edit {
        Append(u8),
        Remove(u8),
        Insert(usize, u8),
        Slice(usize, usize, Vec<u8>),
    }

    fn edit() -> impl Strategy<Value = Edit> {
        prop_oneof![
            (0u8..8).prop_map(Edit::Append),
            (0u8..8).prop_map(Edit::Remove),
            (0usize..6, 0u8..8).prop_map(|(i, v)| Edit::Insert(i, v)),
            (0usize..3, 0usize..3, proptest::collection::vec(0u8..8, 0..3))
                .prop_map(|(s, n, v)| Edit::Slice(s, s + n, v)),
        ]
    }

    fn value(v: u8) -> String {
        // alternate case so case-insensitive matching is exercised
        if v % 2 == 0 {
            format!("val{}", v)
        } else {
            format!("VAL{}", v)
        }
    }

    proptest! {
        #[test]
        fn prop_added_and_removed_stay_disjoint(
            initial in proptest::collection::btree_set(0u8..8, 0..5),
            edits in proptest::collection::vec(edit(), 0..40),
        ) {
            let mut list = ValueList::from_server(initial.iter().map(|v| value(*v)));
            for e in edits {
                let _ = match e {
                    Edit::Append(v) => list.append(value(v)),
                    Edit::Remove(v) => list.remove(&value(v)).map(|_| ()),
                    Edit::Insert(i, v) => list.insert(i, value(v)),
                    Edit::Slice(s, end, vs) => {
                        // never a full-range replace: keep the delta path exercised
                        if s == 0 && end >= list.len() {
                            Ok(())
                        } else {
                            list.set_slice(s..end, vs.into_iter().map(value))
                        }
                    }
                };
                for a in list.added() {
                    prop_assert!(!list.removed().iter().any(|r| eq_fold(r, a)));
                    prop_assert!(list.contains(a));
                }
                for r in list.removed() {
                    prop_assert!(!list.contains(r));
                }
            }
        }
    }
}
