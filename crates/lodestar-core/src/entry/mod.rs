//! Directory entries and their change tracking
//!
//! An [`Entry`] is a distinguished name plus an [`AttributeMap`]. Every edit
//! is recorded as a delta against the last committed state so that a commit
//! sends only what changed, and a rejected commit can be undone with
//! [`rollback`].

mod attributes;
mod batch;
mod values;

pub use attributes::AttributeMap;
pub use batch::{build, rollback, ModOp, Modification, OperationBatch};
pub use values::{ValueList, ValueStatus};

use crate::error::Result;

/// Case-insensitive comparison used for attribute names and values
pub(crate) fn eq_fold(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase()
}

/// One directory object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    dn: String,
    attributes: AttributeMap,
}

impl Entry {
    /// New client-side entry; nothing exists on the server yet.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: AttributeMap::new(),
        }
    }

    /// Entry materialized from a search result
    pub fn from_search<I, N, V, S>(dn: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dn: dn.into(),
            attributes: AttributeMap::from_server(attributes),
        }
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// Update the DN after the server accepted a rename
    pub fn set_dn(&mut self, dn: impl Into<String>) {
        self.dn = dn.into();
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut AttributeMap {
        &mut self.attributes
    }

    pub fn get(&self, name: &str) -> Option<&ValueList> {
        self.attributes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ValueList> {
        self.attributes.get_mut(name)
    }

    /// First value of an attribute
    pub fn first(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.first())
    }

    pub fn set<I, S>(&mut self, name: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes.set(name, values)
    }

    pub fn remove(&mut self, name: &str) -> Option<ValueList> {
        self.attributes.remove(name)
    }

    pub fn has_changes(&self) -> bool {
        self.attributes.has_changes()
    }

    /// Current attribute values, as sent by an add request
    pub fn to_attribute_list(&self) -> Vec<(String, Vec<String>)> {
        self.attributes
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| (name.to_string(), values.values().to_vec()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eq_fold() {
        assert!(eq_fold("objectClass", "OBJECTCLASS"));
        assert!(eq_fold("Ärger", "äRGER"));
        assert!(!eq_fold("cn", "sn"));
    }

    #[test]
    fn test_entry_from_search() {
        let entry = Entry::from_search(
            "uid=bob,ou=people,dc=example,dc=com",
            [("uid", vec!["bob"]), ("mail", vec!["bob@example.com"])],
        );

        assert_eq!(entry.first("UID"), Some("bob"));
        assert!(!entry.has_changes());
        assert_eq!(entry.to_attribute_list().len(), 2);
    }

    #[test]
    fn test_new_entry_attribute_list_skips_empty() {
        let mut entry = Entry::new("cn=new,dc=example,dc=com");
        entry.set("cn", ["new"]).unwrap();
        entry.set("description", Vec::<String>::new()).unwrap();

        assert_eq!(
            entry.to_attribute_list(),
            vec![("cn".to_string(), vec!["new".to_string()])]
        );
    }
}
