//! Sub-commands over a columnar notebook container.
//!
//! Every command respects record immutability: sets can be listed,
//! selected, removed or duplicated, but no command touches an
//! individual record.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::Cell;

use sweeplab_core::ResultSet;
use sweeplab_storage::{ColumnarBackend, NotebookBackend, StoredNotebook};

use crate::output::{current_marker, kind_label, lock_badge, table};

#[derive(Debug, Parser)]
#[command(
    name = "sweeplab",
    about = "Inspect and manage columnar sweeplab notebooks",
    version
)]
pub struct Cli {
    /// Notebook container directory
    #[arg(short, long, global = true, default_value = "notebook.sweeplab")]
    pub notebook: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List result sets with record counts and schemas
    Show,

    /// Change the current result set
    Select {
        /// Tag of the set to select
        tag: String,
    },

    /// Delete a result set; refused when the notebook is locked
    Remove {
        /// Tag of the set to delete
        tag: String,
    },

    /// Duplicate a result set into another notebook container
    Copy {
        /// Tag of the set to copy
        tag: String,

        /// Destination notebook container
        destination: PathBuf,

        /// Tag to use in the destination (defaults to the source tag)
        #[arg(long)]
        as_tag: Option<String>,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Show => show(&cli.notebook),
        Command::Select { tag } => select(&cli.notebook, &tag),
        Command::Remove { tag } => remove(&cli.notebook, &tag),
        Command::Copy {
            tag,
            destination,
            as_tag,
        } => copy(&cli.notebook, &tag, &destination, as_tag.as_deref()),
    }
}

fn open_existing(path: &Path) -> Result<StoredNotebook> {
    if !path.exists() {
        bail!("notebook '{}' does not exist", path.display());
    }
    StoredNotebook::open(path, Box::new(ColumnarBackend::new()), "", "")
        .with_context(|| format!("opening notebook '{}'", path.display()))
}

fn show(path: &Path) -> Result<()> {
    let notebook = open_existing(path)?;

    println!(
        "{} {} ({})",
        "Notebook:".bold(),
        if notebook.name().is_empty() {
            path.display().to_string()
        } else {
            notebook.name().to_string()
        },
        lock_badge(notebook.locked())
    );
    if !notebook.description().is_empty() {
        println!("{}", notebook.description().dimmed());
    }

    let mut sets = table(&["", "Tag", "Records", "Pending", "State", "Description"]);
    for (tag, set) in notebook.result_sets() {
        sets.add_row(vec![
            Cell::new(current_marker(tag == notebook.current_tag())),
            Cell::new(tag),
            Cell::new(set.len()),
            Cell::new(set.pending_records().len()),
            Cell::new(lock_badge(set.locked())),
            Cell::new(set.description()),
        ]);
    }
    println!("{sets}");

    for (tag, set) in notebook.result_sets() {
        if set.schema().is_empty() {
            continue;
        }
        println!("\n{} {}", "Schema of".bold(), tag.cyan());
        let mut schema = table(&["Field", "Kind", "Section"]);
        for field in set.schema().iter() {
            let section = if set.parameter_names().contains(&field.name) {
                "parameter"
            } else if set.result_names().contains(&field.name) {
                "result"
            } else {
                "metadata"
            };
            schema.add_row(vec![
                Cell::new(&field.name),
                Cell::new(kind_label(field.kind)),
                Cell::new(section),
            ]);
        }
        println!("{schema}");
    }
    Ok(())
}

fn select(path: &Path, tag: &str) -> Result<()> {
    let mut notebook = open_existing(path)?;
    notebook.select(tag)?;
    notebook.close()?;
    println!("selected '{}'", tag.cyan());
    Ok(())
}

fn remove(path: &Path, tag: &str) -> Result<()> {
    let mut notebook = open_existing(path)?;
    notebook.delete_result_set(tag)?;
    notebook.close()?;
    println!("removed '{}'", tag.cyan());
    Ok(())
}

fn copy(path: &Path, tag: &str, destination: &Path, as_tag: Option<&str>) -> Result<()> {
    let source = ColumnarBackend::new().load(path)?;
    let set = source
        .result_set(tag)
        .with_context(|| format!("no result set '{tag}' in '{}'", path.display()))?;
    let duplicate = duplicate_set(set)?;

    let target_tag = as_tag.unwrap_or(tag);
    let mut target = StoredNotebook::open(
        destination,
        Box::new(ColumnarBackend::new()),
        "",
        "",
    )?;
    target.adopt_result_set(target_tag, duplicate)?;
    target.close()?;
    println!(
        "copied '{}' to '{}' as '{}'",
        tag.cyan(),
        destination.display(),
        target_tag.cyan()
    );
    Ok(())
}

fn duplicate_set(set: &ResultSet) -> Result<ResultSet> {
    let rebuilt = ResultSet::from_parts(
        set.description().to_string(),
        set.locked(),
        set.attributes().clone(),
        set.records(),
        set.pending_records().to_vec(),
    )?;
    Ok(rebuilt)
}
