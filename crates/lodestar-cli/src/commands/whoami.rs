//! whoami command - show the bound identity

use super::CommandContext;
use crate::utils::format_authz_id;
use anyhow::{bail, Result};
use colored::Colorize;
use lodestar_client::{nonblocking, Connection, OperationResult};
use serde::Serialize;

#[derive(Serialize)]
struct WhoamiResult {
    url: String,
    authz_id: String,
}

pub async fn execute(ctx: &CommandContext, connection: &mut Connection) -> Result<()> {
    let handle = connection.whoami()?;
    let value = match nonblocking::complete(connection, handle, ctx.timeout).await? {
        OperationResult::Extended { value, .. } => value,
        other => bail!("Unexpected reply to whoami: {:?}", other),
    };

    let result = WhoamiResult {
        url: ctx.config.connection.url.clone(),
        authz_id: format_authz_id(value.as_deref()),
    };

    if ctx.is_json() {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.authz_id.green());
        ctx.info(&format!("  {}: {}", "Server".cyan(), result.url));
    }

    Ok(())
}
