//! Interactive client shell
//!
//! Reads a query, a target node id, and an optional JSON argument list,
//! sends the EXECUTE to the coordinator, and prints the outcome.

use anyhow::{bail, Result};
use clap::Parser;
use pact_core::{NodeAddress, NodeId, Request, RpcClient, SqlValue};
use std::io::{self, BufRead, Write};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "client", about = "Two-phase commit client shell")]
struct Args {
    /// Coordinator address (host:port)
    #[arg(long)]
    coordinator: NodeAddress,
}

fn parse_args_line(line: &str) -> Result<Vec<SqlValue>> {
    if line.trim().is_empty() {
        return Ok(Vec::new());
    }
    let values: Vec<serde_json::Value> = serde_json::from_str(line.trim())?;
    values
        .into_iter()
        .map(|value| match value {
            serde_json::Value::String(s) => Ok(SqlValue::Text(s)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(v) => Ok(SqlValue::Int(v)),
                None => bail!("only integer numbers are supported"),
            },
            other => bail!("unsupported argument: {}", other),
        })
        .collect()
}

fn prompt(out: &mut impl Write, text: &str) -> io::Result<()> {
    write!(out, "{}", text)?;
    out.flush()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let coordinator = RpcClient::new(args.coordinator.to_string(), Duration::from_secs(60));
    println!("Connected to coordinator at {}.", args.coordinator);

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut stdout = io::stdout();

    loop {
        println!();
        println!("------------------- NEW QUERY -------------------");
        prompt(&mut stdout, "query> ")?;
        let query = match lines.next() {
            Some(line) => line?,
            None => break,
        };
        if query.trim().is_empty() {
            break;
        }

        prompt(&mut stdout, "node id> ")?;
        let node_id: NodeId = match lines.next() {
            Some(line) => match line?.trim().parse() {
                Ok(id) => id,
                Err(_) => {
                    println!("Error: node id must be a non-negative integer");
                    continue;
                }
            },
            None => break,
        };

        prompt(&mut stdout, "args (JSON array, blank for none)> ")?;
        let sql_args = match lines.next() {
            Some(line) => match parse_args_line(&line?) {
                Ok(values) => values,
                Err(e) => {
                    println!("Error: {}", e);
                    continue;
                }
            },
            None => break,
        };

        let request = Request::ClientExecute {
            node_id,
            query,
            args: sql_args,
        };
        match coordinator.send(&request).await {
            Ok(true) => println!("OK"),
            Ok(false) => println!("Error: EXECUTE was not successful"),
            Err(e) => println!("Error: {}", e),
        }
    }

    println!("Bye.");
    Ok(())
}
