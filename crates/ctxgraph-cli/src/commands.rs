use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use colored::Colorize;
use serde_json::{json, Value};
use tracing::{debug, info};

use ctxgraph_context::{ContextError, CoordinatorConfig, SaveReport, StoreCoordinator};
use ctxgraph_store::{JournalConfig, JournalStore, ObjectGraphSchema};
use ctxgraph_types::{Attributes, ManagedObject};

use crate::cli::*;

/// An opened coordinator plus the journal it runs on.
struct Session {
    coordinator: StoreCoordinator,
    journal: Arc<JournalStore>,
    schema: ObjectGraphSchema,
    format: OutputFormat,
}

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let session = open_session(&cli).await?;
    debug!(command = ?cli.command, "dispatching command");
    match cli.command {
        Command::Init => cmd_init(&session),
        Command::Insert(args) => cmd_insert(&session, args).await,
        Command::Update(args) => cmd_update(&session, args).await,
        Command::Delete(args) => cmd_delete(&session, args).await,
        Command::Get(args) => cmd_get(&session, args).await,
        Command::List(args) => cmd_list(&session, args),
        Command::Stats => cmd_stats(&session).await,
    }
}

async fn open_session(cli: &Cli) -> anyhow::Result<Session> {
    let config = match &cli.config {
        Some(path) => CoordinatorConfig::load(path)?,
        None => CoordinatorConfig::default(),
    };
    let schema = match &cli.schema {
        Some(path) => load_schema(path)?,
        None => ObjectGraphSchema::empty(),
    };

    let journal = Arc::new(JournalStore::new(cli.store.clone(), JournalConfig::default()));
    let coordinator = StoreCoordinator::new(journal.clone(), config);
    coordinator
        .open(schema.clone())
        .await
        .with_context(|| format!("cannot open {}", cli.store.display()))?;
    info!(
        store = %cli.store.display(),
        schema = %schema.fingerprint().short_hex(),
        journal_bytes = journal.journal_len(),
        "session opened"
    );

    Ok(Session {
        coordinator,
        journal,
        schema,
        format: cli.format,
    })
}

fn load_schema(path: &Path) -> anyhow::Result<ObjectGraphSchema> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read schema {}", path.display()))?;
    let schema = if path.extension().is_some_and(|ext| ext == "json") {
        ObjectGraphSchema::from_json_str(&text)?
    } else {
        ObjectGraphSchema::from_toml_str(&text)?
    };
    Ok(schema)
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_object(object: &ManagedObject) {
    println!("{} {}", object.reference.to_string().yellow(), object.entity.cyan().bold());
    for (key, value) in &object.attributes {
        println!("  {}: {}", key.bold(), value);
    }
}

fn print_save(session: &Session, verb: &str, report: &SaveReport) -> anyhow::Result<()> {
    if session.format == OutputFormat::Json {
        return print_json(&json!({
            "seq": report.seq().map(|s| s.value()),
            "change_set": report.change_set.as_ref(),
            "merges": report.merges,
        }));
    }
    match report.seq() {
        Some(seq) => println!(
            "{} {} (commit {}, merged into {} context(s))",
            "✓".green().bold(),
            verb,
            seq.to_string().yellow(),
            report.merges.len()
        ),
        None => println!("No changes."),
    }
    Ok(())
}

fn cmd_init(session: &Session) -> anyhow::Result<()> {
    let fingerprint = session.schema.fingerprint();
    let objects = session.coordinator.references()?.len();
    if session.format == OutputFormat::Json {
        return print_json(&json!({
            "store": session.journal.path(),
            "schema": fingerprint.to_hex(),
            "objects": objects,
        }));
    }
    println!(
        "{} Journal ready at {}",
        "✓".green().bold(),
        session.journal.path().display().to_string().bold()
    );
    println!("  Schema: {}", fingerprint.short_hex().cyan());
    println!("  Objects: {}", objects);
    Ok(())
}

async fn cmd_insert(session: &Session, args: InsertArgs) -> anyhow::Result<()> {
    let attributes: Attributes = args.set.into_iter().collect();
    let entity = args.entity;
    let report = session
        .coordinator
        .save_data_in_background(|ctx| async move {
            ctx.insert(entity, attributes).await?;
            Ok::<_, ContextError>(())
        })
        .await?;

    if session.format == OutputFormat::Text {
        for object in report.change_set.inserted() {
            println!("{} {}", "Inserted".green(), object.reference.to_string().yellow());
        }
    }
    print_save(session, "Saved", &report)
}

async fn cmd_update(session: &Session, args: UpdateArgs) -> anyhow::Result<()> {
    if args.set.is_empty() && args.unset.is_empty() {
        bail!("nothing to update: pass --set key=value or --unset key");
    }
    let reference = args.reference;
    let set: Attributes = args.set.into_iter().collect();
    let unset = args.unset;
    let report = session
        .coordinator
        .save_data_in_background(|ctx| async move {
            ctx.update(reference, set).await?;
            for key in unset {
                ctx.remove_attribute(reference, key).await?;
            }
            Ok::<_, ContextError>(())
        })
        .await?;
    print_save(session, &format!("Updated {}", reference.short_id()), &report)
}

async fn cmd_delete(session: &Session, args: DeleteArgs) -> anyhow::Result<()> {
    let reference = args.reference;
    let report = session
        .coordinator
        .save_data_in_background(|ctx| async move { ctx.delete(reference).await })
        .await?;
    print_save(session, &format!("Deleted {}", reference.short_id()), &report)
}

async fn cmd_get(session: &Session, args: GetArgs) -> anyhow::Result<()> {
    let master = session.coordinator.master_context()?;
    let Some(object) = master.get(args.reference).await? else {
        bail!("object not found: {}", args.reference);
    };
    if session.format == OutputFormat::Json {
        return print_json(&serde_json::to_value(&object)?);
    }
    print_object(&object);
    Ok(())
}

fn cmd_list(session: &Session, args: ListArgs) -> anyhow::Result<()> {
    let mut objects = Vec::new();
    for reference in session.coordinator.references()? {
        if let Some(object) = session.coordinator.fetch(&reference)? {
            if args.entity.as_deref().map_or(true, |e| e == object.entity) {
                objects.push(object);
            }
        }
    }

    if session.format == OutputFormat::Json {
        return print_json(&serde_json::to_value(&objects)?);
    }
    if objects.is_empty() {
        println!("No objects.");
        return Ok(());
    }
    for object in &objects {
        println!(
            "{}  {}  {}",
            object.reference.short_id().yellow(),
            object.entity.cyan(),
            serde_json::to_string(&object.attributes)?.dimmed()
        );
    }
    Ok(())
}

async fn cmd_stats(session: &Session) -> anyhow::Result<()> {
    let coordinator = &session.coordinator;
    let last_commit = coordinator.last_commit_seq().await;
    let objects = coordinator.references()?.len();
    let master = coordinator.master_context()?.stats().await?;
    let contexts = coordinator.registered_roles();

    if session.format == OutputFormat::Json {
        return print_json(&json!({
            "store": session.journal.path(),
            "journal_bytes": session.journal.journal_len(),
            "schema": session.schema.fingerprint().to_hex(),
            "last_commit": last_commit.map(|s| s.value()),
            "objects": objects,
            "contexts": contexts
                .iter()
                .map(|(id, role)| json!({ "id": id.to_string(), "role": role }))
                .collect::<Vec<_>>(),
            "master": master,
        }));
    }

    println!("Store: {}", session.journal.path().display().to_string().bold());
    println!("  Journal: {} bytes", session.journal.journal_len());
    println!("  Schema: {}", session.schema.fingerprint().short_hex().cyan());
    match last_commit {
        Some(seq) => println!("  Last commit: {}", seq.to_string().yellow()),
        None => println!("  Last commit: {}", "none".dimmed()),
    }
    println!("  Objects: {}", objects);
    println!("Contexts:");
    for (id, role) in &contexts {
        println!("  {} {}", id.to_string().yellow(), role);
    }
    println!(
        "Master: {} materialized, {} merges applied",
        master.materialized, master.merges_applied
    );
    Ok(())
}
