//! search command - query the directory

use super::CommandContext;
use crate::utils::EntryOutput;
use anyhow::{bail, Context, Result};
use colored::Colorize;
use lodestar_client::{nonblocking, Connection, OperationResult, Scope, SearchRequest};
use serde::Serialize;

pub struct SearchOptions {
    pub base: String,
    pub filter: String,
    pub attributes: Vec<String>,
    pub scope: String,
    pub size_limit: i32,
    pub time_limit: i32,
    pub page_size: Option<i32>,
}

#[derive(Serialize)]
struct SearchOutput {
    entries: Vec<EntryOutput>,
    references: Vec<String>,
    truncated: bool,
}

impl SearchOptions {
    fn to_request(&self) -> Result<SearchRequest> {
        let scope = Scope::parse(&self.scope)
            .with_context(|| format!("Unknown scope '{}' (use base, one or sub)", self.scope))?;

        let mut request = SearchRequest::new(&self.base, scope, &self.filter)
            .attributes(&self.attributes)
            .size_limit(self.size_limit)
            .time_limit(self.time_limit);
        if let Some(size) = self.page_size {
            if size <= 0 {
                bail!("Page size must be positive");
            }
            request = request.page_size(size);
        }
        Ok(request)
    }
}

pub async fn execute(ctx: &CommandContext, connection: &mut Connection, opts: SearchOptions) -> Result<()> {
    let request = opts.to_request()?;
    let mut handle = connection.search(request)?;

    let mut output = SearchOutput {
        entries: Vec::new(),
        references: Vec::new(),
        truncated: false,
    };

    // every page is printed as it arrives in text mode
    loop {
        let page = match nonblocking::complete(connection, handle, ctx.timeout).await? {
            OperationResult::Search(page) => page,
            other => bail!("Unexpected reply to search: {:?}", other),
        };

        if !ctx.is_json() {
            for entry in &page.entries {
                print_entry(&EntryOutput::from(entry));
            }
            for reference in &page.references {
                println!("{} {}\n", "ref:".yellow(), reference);
            }
        }

        output.entries.extend(page.entries.iter().map(EntryOutput::from));
        output.references.extend(page.references);
        output.truncated |= page.truncated;

        match page.next_page {
            Some(next) => handle = next,
            None => break,
        }
    }

    if ctx.is_json() {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        let mut summary = format!("{} entries", output.entries.len());
        if !output.references.is_empty() {
            summary.push_str(&format!(", {} references", output.references.len()));
        }
        ctx.info(&format!("# {}", summary));
        if output.truncated {
            eprintln!("{}", "warning: results truncated by a server limit".yellow());
        }
    }

    Ok(())
}

fn print_entry(entry: &EntryOutput) {
    println!("{} {}", "dn:".blue().bold(), entry.dn);
    for (name, values) in &entry.attributes {
        for value in values {
            println!("{}: {}", name.cyan(), value);
        }
    }
    println!();
}
