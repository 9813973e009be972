//! rename command - rename or move an entry

use super::CommandContext;
use anyhow::{bail, Result};
use colored::Colorize;
use lodestar_client::{nonblocking, Connection, OperationResult};
use serde::Serialize;

#[derive(Serialize)]
struct RenameResult {
    dn: String,
    new_dn: String,
}

pub async fn execute(
    ctx: &CommandContext,
    connection: &mut Connection,
    dn: &str,
    new_rdn: &str,
    new_superior: Option<&str>,
    delete_old_rdn: bool,
) -> Result<()> {
    if new_rdn.trim().is_empty() {
        bail!("New RDN cannot be empty");
    }

    let handle = connection.rename(dn, new_rdn, new_superior, delete_old_rdn)?;
    let result = match nonblocking::complete(connection, handle, ctx.timeout).await? {
        OperationResult::Renamed { dn, new_dn } => RenameResult { dn, new_dn },
        other => bail!("Unexpected reply to rename: {:?}", other),
    };

    if ctx.is_json() {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        ctx.info(&format!(
            "{}: {} -> {}",
            "rename".green(),
            result.dn,
            result.new_dn
        ));
    }

    Ok(())
}
