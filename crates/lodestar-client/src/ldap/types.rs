//! Conversions between ldap3 types and the engine's wire types

use std::collections::HashSet;

use tracing::debug;

use ldap3::{LdapResult, Mod, ResultEntry, Scope as LdapScope, SearchEntry};

use lodestar_core::entry::{ModOp, Modification};

use crate::engine::{LdapOutcome, RawEntry, RawResult, Scope};

pub(crate) fn scope(scope: Scope) -> LdapScope {
    match scope {
        Scope::Base => LdapScope::Base,
        Scope::OneLevel => LdapScope::OneLevel,
        Scope::Subtree => LdapScope::Subtree,
    }
}

pub(crate) fn outcome(result: &LdapResult) -> LdapOutcome {
    LdapOutcome {
        code: result.rc,
        matched_dn: result.matched.clone(),
        message: result.text.clone(),
    }
}

/// A search result message: an entry or a continuation reference
pub(crate) fn search_message(entry: ResultEntry) -> RawResult {
    if entry.is_ref() {
        return RawResult::SearchReference(ldap3::parse_refs(entry.0));
    }
    RawResult::SearchEntry(raw_entry(SearchEntry::construct(entry)))
}

/// Text attributes only. Values that are not valid UTF-8 (certificates,
/// photos) cannot round-trip through the entry model, so those attributes
/// are left out rather than rewritten on the next commit.
fn raw_entry(entry: SearchEntry) -> RawEntry {
    let SearchEntry {
        dn,
        attrs,
        bin_attrs,
    } = entry;

    if !bin_attrs.is_empty() {
        let skipped: Vec<&str> = bin_attrs.keys().map(String::as_str).collect();
        debug!(dn = %dn, attributes = ?skipped, "Skipping binary attributes");
    }

    RawEntry {
        dn,
        attributes: attrs.into_iter().collect(),
    }
}

pub(crate) fn add_attributes(attributes: &[(String, Vec<String>)]) -> Vec<(String, HashSet<String>)> {
    attributes
        .iter()
        .map(|(name, values)| (name.clone(), values.iter().cloned().collect()))
        .collect()
}

pub(crate) fn modification(record: &Modification) -> Mod<String> {
    let values: HashSet<String> = record.values.iter().cloned().collect();
    let attribute = record.attribute.clone();
    match record.op {
        ModOp::Add => Mod::Add(attribute, values),
        ModOp::Delete => Mod::Delete(attribute, values),
        ModOp::Replace => Mod::Replace(attribute, values),
    }
}
