//! Consent Guard CLI
//!
//! Operator tooling around the consent core.
//!
//! Usage:
//!   consent-guard replay <script.json> [--format table]
//!   consent-guard config [--config <path>]
//!   consent-guard code [--actor <id>] [--hours <h>]

mod script;

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use consent_core::{ActorId, ConsentConfig, EmergencyCodeBook};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "consent-guard")]
#[command(author = "Mycelix Health")]
#[command(version)]
#[command(about = "Replay consent scenarios and manage access guard settings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format: json, compact, csv, or table
    #[arg(short, long, default_value = "json")]
    format: String,

    /// Output file (stdout if not specified)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted sequence of role actions against an in-memory deployment
    Replay {
        /// Script file (JSON)
        script: PathBuf,
    },

    /// Print the effective configuration
    Config,

    /// Generate an emergency access code
    Code {
        /// Restrict the code to one actor
        #[arg(short, long)]
        actor: Option<String>,

        /// Hours until the code expires
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ConsentConfig, Box<dyn std::error::Error>> {
    match path {
        // from_path validates what it reads
        Some(path) => Ok(ConsentConfig::from_path(path)?),
        None => {
            let config = ConsentConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let result: Value = match cli.command {
        Commands::Replay { script } => {
            let raw = fs::read_to_string(&script)?;
            let parsed = script::Script::from_json_str(&raw)?;
            let report = script::replay(parsed, config).await?;
            serde_json::to_value(report)?
        }
        Commands::Config => serde_json::to_value(&config)?,
        Commands::Code { actor, hours } => {
            let book = EmergencyCodeBook::random();
            let expires_at = code_expiry(Utc::now(), hours)?;
            let issued_to = actor.map(ActorId::from);
            let code = book.generate(issued_to.clone(), expires_at)?;
            serde_json::json!({
                "code": code,
                "issued_to": issued_to,
                "expires_at": expires_at,
            })
        }
    };

    let output_str = match cli.format.as_str() {
        "json" => serde_json::to_string_pretty(&result)?,
        "compact" => serde_json::to_string(&result)?,
        "csv" => result_to_csv(&result)?,
        "table" => result_to_table(&result),
        other => return Err(format!("unknown output format: {}", other).into()),
    };

    if let Some(output_path) = cli.output {
        fs::write(&output_path, &output_str)?;
        eprintln!("Output written to: {}", output_path.display());
    } else {
        println!("{}", output_str);
    }

    Ok(())
}

/// Expiry `hours` after `now`, rejecting non-positive or out of range values
fn code_expiry(now: DateTime<Utc>, hours: i64) -> Result<DateTime<Utc>, String> {
    if hours <= 0 {
        return Err("--hours must be positive".to_string());
    }
    Duration::try_hours(hours)
        .and_then(|valid| now.checked_add_signed(valid))
        .ok_or_else(|| format!("--hours {} is out of range", hours))
}

/// Render a scalar cell; nested values fall back to compact JSON
fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

/// Rows of an array of objects, keyed by the first object's fields
fn rows(items: &[Value]) -> Option<(Vec<String>, Vec<Vec<String>>)> {
    let headers: Vec<String> = items.first()?.as_object()?.keys().cloned().collect();
    let body = items
        .iter()
        .filter_map(Value::as_object)
        .map(|obj| {
            headers
                .iter()
                .map(|h| obj.get(h).map(cell).unwrap_or_default())
                .collect()
        })
        .collect();
    Some((headers, body))
}

fn result_to_csv(value: &Value) -> Result<String, Box<dyn std::error::Error>> {
    let items = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => match obj.get("steps").or_else(|| obj.get("audit_trail")) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return Ok(serde_json::to_string(value)?),
        },
        _ => return Ok(serde_json::to_string(value)?),
    };

    let mut output = String::new();
    if let Some((headers, body)) = rows(items) {
        output.push_str(&headers.join(","));
        output.push('\n');
        for row in body {
            let escaped: Vec<String> = row
                .iter()
                .map(|c| {
                    if c.contains(',') || c.contains('"') {
                        format!("\"{}\"", c.replace('"', "\"\""))
                    } else {
                        c.clone()
                    }
                })
                .collect();
            output.push_str(&escaped.join(","));
            output.push('\n');
        }
    }
    Ok(output)
}

fn render_rows(headers: &[String], body: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in body {
        for (i, c) in row.iter().enumerate() {
            widths[i] = widths[i].max(c.chars().count());
        }
    }

    let line = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = line(headers);
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("  "),
    );
    for row in body {
        out.push('\n');
        out.push_str(&line(row));
    }
    out
}

fn result_to_table(value: &Value) -> String {
    match value {
        Value::Array(items) => match rows(items) {
            Some((headers, body)) => render_rows(&headers, &body),
            None => cell(value),
        },
        Value::Object(obj) => {
            let mut sections = Vec::new();
            let mut scalars = Vec::new();
            for (key, field) in obj {
                match field {
                    Value::Array(items) if items.first().is_some_and(Value::is_object) => {
                        if let Some((headers, body)) = rows(items) {
                            sections.push(format!("{}\n{}", key, render_rows(&headers, &body)));
                        }
                    }
                    _ => scalars.push(format!("{}: {}", key, cell(field))),
                }
            }
            if !scalars.is_empty() {
                sections.insert(0, scalars.join("\n"));
            }
            sections.join("\n\n")
        }
        other => cell(other),
    }
}
