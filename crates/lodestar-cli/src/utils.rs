//! Utility functions for the Lodestar CLI

use anyhow::{bail, Result};
use lodestar_core::Entry;
use serde::Serialize;
use std::collections::BTreeMap;

/// JSON shape of one entry
#[derive(Debug, Serialize)]
pub struct EntryOutput {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl From<&Entry> for EntryOutput {
    fn from(entry: &Entry) -> Self {
        Self {
            dn: entry.dn().to_string(),
            attributes: entry
                .attributes()
                .iter()
                .map(|(name, values)| (name.to_string(), values.values().to_vec()))
                .collect(),
        }
    }
}

/// Split `attr=value` into its parts; a bare `attr` has no value
pub fn parse_assignment(arg: &str) -> Result<(String, Option<String>)> {
    let (name, value) = match arg.split_once('=') {
        Some((name, value)) => (name.trim(), Some(value.to_string())),
        None => (arg.trim(), None),
    };
    if name.is_empty() {
        bail!("Missing attribute name in '{}'", arg);
    }
    Ok((name.to_string(), value))
}

/// Group `attr=value` arguments by attribute, keeping first-seen order.
/// Names match case-insensitively.
pub fn group_assignments(args: &[String]) -> Result<Vec<(String, Vec<String>)>> {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for arg in args {
        let (name, value) = parse_assignment(arg)?;
        let Some(value) = value else {
            bail!("Expected attr=value, got '{}'", arg);
        };
        match groups.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some((_, values)) => values.push(value),
            None => groups.push((name, vec![value])),
        }
    }
    Ok(groups)
}

/// Render the authorization identity returned by "Who am I?"
pub fn format_authz_id(value: Option<&[u8]>) -> String {
    match value {
        Some(bytes) if !bytes.is_empty() => String::from_utf8_lossy(bytes).into_owned(),
        _ => "anonymous".to_string(),
    }
}
