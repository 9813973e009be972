//! add command - create an entry

use super::CommandContext;
use crate::utils::{group_assignments, EntryOutput};
use anyhow::{Context, Result};
use colored::Colorize;
use lodestar_client::{nonblocking, Connection};
use lodestar_core::Entry;

pub async fn execute(
    ctx: &CommandContext,
    connection: &mut Connection,
    dn: &str,
    attributes: &[String],
) -> Result<()> {
    let mut entry = Entry::new(dn);
    for (name, values) in group_assignments(attributes)? {
        entry
            .set(&name, values)
            .with_context(|| format!("Invalid values for {}", name))?;
    }

    let handle = connection.add(&mut entry)?;
    nonblocking::complete_commit(connection, handle, &mut entry, ctx.timeout)
        .await
        .with_context(|| format!("Failed to add {}", dn))?;

    if ctx.is_json() {
        println!("{}", serde_json::to_string_pretty(&EntryOutput::from(&entry))?);
    } else {
        ctx.info(&format!("{}: {}", "add".green(), entry.dn()));
    }

    Ok(())
}
