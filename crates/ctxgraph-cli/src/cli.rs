use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use ctxgraph_types::ObjectRef;

#[derive(Parser)]
#[command(
    name = "ctxgraph",
    about = "ctxgraph -- inspect and edit an object graph journal",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Journal file backing the store
    #[arg(long, global = true, default_value = "ctxgraph.journal")]
    pub store: PathBuf,

    /// Coordinator configuration (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Object graph schema (TOML, or JSON with a .json extension)
    #[arg(long, global = true)]
    pub schema: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the journal (or check an existing one against the schema)
    Init,
    /// Insert a new object
    Insert(InsertArgs),
    /// Set or remove attributes of an object
    Update(UpdateArgs),
    /// Delete an object
    Delete(DeleteArgs),
    /// Show one object
    Get(GetArgs),
    /// List stored objects
    List(ListArgs),
    /// Show store and context statistics
    Stats,
}

#[derive(Debug, Args)]
pub struct InsertArgs {
    pub entity: String,
    /// Attribute assignment `key=value`; the value is parsed as JSON when
    /// possible and kept as a string otherwise
    #[arg(long = "set", value_parser = parse_assignment)]
    pub set: Vec<(String, Value)>,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    pub reference: ObjectRef,
    #[arg(long = "set", value_parser = parse_assignment)]
    pub set: Vec<(String, Value)>,
    /// Attribute to remove
    #[arg(long)]
    pub unset: Vec<String>,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    pub reference: ObjectRef,
}

#[derive(Debug, Args)]
pub struct GetArgs {
    pub reference: ObjectRef,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only list objects of this entity
    #[arg(long)]
    pub entity: Option<String>,
}

pub fn parse_assignment(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty attribute name in `{s}`"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
