//! modify command - change attributes of an existing entry
//!
//! The entry is read first so that the change set is computed against what
//! the server holds. Edits apply in the order: deletes, adds, replaces.

use super::CommandContext;
use crate::utils::{group_assignments, parse_assignment, EntryOutput};
use anyhow::{bail, Context, Result};
use colored::Colorize;
use lodestar_client::{nonblocking, Connection, OperationResult, Scope, SearchRequest};
use lodestar_core::Entry;
use tracing::debug;

pub struct ModifyOptions {
    pub add: Vec<String>,
    pub delete: Vec<String>,
    pub replace: Vec<String>,
}

impl ModifyOptions {
    fn is_empty(&self) -> bool {
        self.add.is_empty() && self.delete.is_empty() && self.replace.is_empty()
    }

    /// Attribute names the edits touch
    fn attribute_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for arg in self.add.iter().chain(&self.delete).chain(&self.replace) {
            let (name, _) = parse_assignment(arg)?;
            if !names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn apply(&self, entry: &mut Entry) -> Result<()> {
        for arg in &self.delete {
            match parse_assignment(arg)? {
                (name, Some(value)) => {
                    let values = entry
                        .get_mut(&name)
                        .with_context(|| format!("Entry has no attribute {}", name))?;
                    values.remove(&value)?;
                }
                (name, None) => {
                    if entry.remove(&name).is_none() {
                        bail!("Entry has no attribute {}", name);
                    }
                }
            }
        }

        for (name, values) in group_assignments(&self.add)? {
            match entry.get_mut(&name) {
                Some(existing) => existing.extend(values)?,
                None => entry.set(&name, values)?,
            }
        }

        for (name, values) in group_assignments(&self.replace)? {
            entry.set(&name, values)?;
        }

        Ok(())
    }
}

pub async fn execute(
    ctx: &CommandContext,
    connection: &mut Connection,
    dn: &str,
    opts: ModifyOptions,
) -> Result<()> {
    if opts.is_empty() {
        bail!("Nothing to change: use --add, --delete or --replace");
    }

    let mut entry = fetch(ctx, connection, dn, opts.attribute_names()?).await?;
    opts.apply(&mut entry)?;

    let Some(handle) = connection.modify(&mut entry)? else {
        ctx.info(&format!("{}: {} (no changes)", "modify".yellow(), dn));
        return Ok(());
    };

    nonblocking::complete_commit(connection, handle, &mut entry, ctx.timeout)
        .await
        .with_context(|| format!("Failed to modify {}", dn))?;

    if ctx.is_json() {
        println!("{}", serde_json::to_string_pretty(&EntryOutput::from(&entry))?);
    } else {
        ctx.info(&format!("{}: {}", "modify".green(), entry.dn()));
    }

    Ok(())
}

/// Read the current values of `attributes` on `dn`
async fn fetch(
    ctx: &CommandContext,
    connection: &mut Connection,
    dn: &str,
    attributes: Vec<String>,
) -> Result<Entry> {
    debug!(%dn, ?attributes, "Reading entry before modify");
    let request = SearchRequest::new(dn, Scope::Base, "(objectClass=*)").attributes(attributes);
    let handle = connection.search(request)?;

    match nonblocking::complete(connection, handle, ctx.timeout).await? {
        OperationResult::Search(page) => page
            .entries
            .into_iter()
            .next()
            .with_context(|| format!("No such entry: {}", dn)),
        other => bail!("Unexpected reply to search: {:?}", other),
    }
}
