//! delete command - remove an entry

use super::CommandContext;
use anyhow::{bail, Result};
use colored::Colorize;
use lodestar_client::{nonblocking, Connection, OperationResult};
use serde_json::json;

pub async fn execute(ctx: &CommandContext, connection: &mut Connection, dn: &str) -> Result<()> {
    let handle = connection.delete(dn)?;
    let dn = match nonblocking::complete(connection, handle, ctx.timeout).await? {
        OperationResult::Deleted { dn } => dn,
        other => bail!("Unexpected reply to delete: {:?}", other),
    };

    if ctx.is_json() {
        println!("{}", serde_json::to_string_pretty(&json!({ "deleted": dn }))?);
    } else {
        ctx.info(&format!("{}: {}", "delete".red(), dn));
    }

    Ok(())
}
