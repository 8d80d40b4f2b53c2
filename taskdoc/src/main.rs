use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use taskdoc::api::{self, PatchRequest};
use taskdoc::config::{self, StoreConfig};
use taskdoc::core::{TaskGroup, TaskRecord};
use taskdoc::parser;
use taskdoc::tokenizer;
use taskdoc::workspace::TaskStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "taskdoc",
    about = "Checkbox tasks and inline metadata in markdown files",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Config file to load instead of ./taskdoc.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Content root, overriding config and environment.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract the tasks of individual markdown files.
    Tasks(TasksArgs),

    /// Scan the content root and print task groups.
    Groups(GroupsArgs),

    /// Change the status or metadata of one task in place.
    Update(UpdateArgs),

    /// Print how a task title is split into title and annotations.
    Tokenize(TokenizeArgs),
}

#[derive(Debug, Args)]
struct TasksArgs {
    /// Markdown files to read. Paths under the content root are read relative to it,
    /// so folder and type match `groups`; other paths use their own parent directory.
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct GroupsArgs {
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
    /// Include single-task groups that are hidden by default.
    #[arg(long)]
    all: bool,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    /// Group id, e.g. `epics/auth` or `docs/intro`.
    group_id: String,
    /// Task id, e.g. `auth-3`.
    subtask_id: String,
    /// New status: todo, in_progress or done.
    #[arg(long)]
    status: Option<String>,
    /// JSON object merged into the task's inline metadata; null deletes a key.
    #[arg(long)]
    metadata: Option<String>,
    /// Print the updated file instead of writing it.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct TokenizeArgs {
    /// Raw task text, everything after the checkbox.
    text: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Tasks(args) => {
            let config = load_store_config(cli.config, cli.root)?;
            handle_tasks(&TaskStore::new(config), args)
        }
        Commands::Groups(args) => {
            let store = open_store(cli.config, cli.root)?;
            handle_groups(&store, args)
        }
        Commands::Update(args) => {
            let store = open_store(cli.config, cli.root)?;
            handle_update(&store, args)
        }
        Commands::Tokenize(args) => handle_tokenize(args),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_store_config(config_path: Option<PathBuf>, root: Option<PathBuf>) -> Result<StoreConfig> {
    let mut config: StoreConfig =
        config::load_config(config_path.as_deref()).context("loading configuration")?;
    if let Some(root) = root {
        config.root = root;
    }
    Ok(config)
}

fn open_store(config_path: Option<PathBuf>, root: Option<PathBuf>) -> Result<TaskStore> {
    let config = load_store_config(config_path, root)?;
    if !config.root.is_dir() {
        anyhow::bail!("content root {:?} is not a directory", config.root);
    }
    Ok(TaskStore::new(config))
}

fn handle_tasks(store: &TaskStore, args: TasksArgs) -> Result<()> {
    let TasksArgs { files, json } = args;

    let mut tasks = Vec::new();
    for path in &files {
        let text = fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
        let parsed = parser::parse_document(&store.logical_path(path), &text)
            .with_context(|| format!("parsing frontmatter of {path:?}"))?;
        tasks.extend(parsed.tasks);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        eprintln!("No tasks found in the provided files.");
        return Ok(());
    }
    let today = Local::now().date_naive();
    for task in &tasks {
        println!("{}", describe_task(task, today));
    }
    Ok(())
}

fn handle_groups(store: &TaskStore, args: GroupsArgs) -> Result<()> {
    let GroupsArgs { json, all } = args;
    let groups = store.manifest()?.groups_for(all);

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }
    if groups.is_empty() {
        eprintln!("No task groups found under {:?}.", store.config().root);
        return Ok(());
    }
    let today = Local::now().date_naive();
    for (idx, group) in groups.iter().enumerate() {
        println!("{}", describe_group(group));
        for task in &group.subtasks {
            println!("  {}", describe_task(task, today));
        }
        if idx + 1 < groups.len() {
            println!();
        }
    }
    Ok(())
}

fn handle_update(store: &TaskStore, args: UpdateArgs) -> Result<()> {
    let UpdateArgs {
        group_id,
        subtask_id,
        status,
        metadata,
        dry_run,
    } = args;

    let metadata = metadata
        .map(|raw| serde_json::from_str::<Map<String, Value>>(&raw))
        .transpose()
        .context("--metadata must be a JSON object")?;
    let request = PatchRequest { status, metadata };

    if dry_run {
        let report = store
            .preview_update(&group_id, &subtask_id, &request.to_update())
            .with_context(|| format!("previewing update of {subtask_id} in {group_id}"))?;
        print!("{}", report.content);
        return Ok(());
    }

    let reply = api::patch_task(store, &group_id, &subtask_id, &request);
    println!("{}", serde_json::to_string_pretty(&reply.body)?);
    if reply.status != 200 {
        anyhow::bail!("update failed with status {}", reply.status);
    }
    Ok(())
}

fn handle_tokenize(args: TokenizeArgs) -> Result<()> {
    let tokens = tokenizer::tokenize(&args.text);
    println!("{}", serde_json::to_string_pretty(&tokens)?);
    Ok(())
}

fn describe_group(group: &TaskGroup) -> String {
    format!(
        "{} [{}] {}/{} done",
        group.id,
        group.group_type.as_str(),
        group.completed_tasks,
        group.total_tasks
    )
}

fn describe_task(task: &TaskRecord, today: NaiveDate) -> String {
    let mut line = format!("{} {} {}", task.status.checkbox(), task.id, task.title);

    let mut notes = Vec::new();
    if let Some(metadata) = &task.metadata {
        if let Some(priority) = metadata.priority {
            notes.push(priority.as_str().to_string());
        }
        if let Some(due) = &metadata.due_date {
            let overdue = !task.completed && metadata.due_on().is_some_and(|date| date < today);
            notes.push(if overdue {
                format!("due {due}, overdue")
            } else {
                format!("due {due}")
            });
        }
        if let Some(assignee) = &metadata.assignee {
            notes.push(format!("+{assignee}"));
        }
        notes.extend(metadata.tags.iter().map(|tag| format!("#{tag}")));
    }
    if let Some(references) = &task.references {
        notes.extend(references.iter().map(|r| format!("ref:{r}")));
    }
    if !notes.is_empty() {
        line.push_str(&format!(" ({})", notes.join(", ")));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn only_task(line: &str) -> TaskRecord {
        parser::extract_tasks(line, Path::new("epics/auth.md"))
            .pop()
            .expect("one task")
    }

    #[test]
    fn describe_task_marks_past_due_dates_overdue() {
        let task = only_task("- [ ] Ship login (high) @2024-01-15 +ann #auth");
        assert_eq!(
            describe_task(&task, date("2024-02-01")),
            "[ ] auth-0 Ship login (high, due 2024-01-15, overdue, +ann, #auth)"
        );
        assert_eq!(
            describe_task(&task, date("2024-01-01")),
            "[ ] auth-0 Ship login (high, due 2024-01-15, +ann, #auth)"
        );
    }

    #[test]
    fn describe_task_leaves_opaque_dates_and_done_tasks_alone() {
        let task = only_task("- [ ] Retro @friday");
        assert_eq!(
            describe_task(&task, date("2030-01-01")),
            "[ ] auth-0 Retro (due friday)"
        );
        let task = only_task("- [x] Old @2020-01-01 ref:docs/setup");
        assert_eq!(
            describe_task(&task, date("2030-01-01")),
            "[x] auth-0 Old (due 2020-01-01, ref:docs/setup)"
        );
    }

    #[test]
    fn cli_parses_update_flags() {
        let cli = Cli::try_parse_from([
            "taskdoc",
            "--root",
            "notes",
            "update",
            "epics/auth",
            "auth-3",
            "--status",
            "done",
            "--dry-run",
        ])
        .expect("parse");
        assert_eq!(cli.root, Some(PathBuf::from("notes")));
        match cli.command {
            Commands::Update(args) => {
                assert_eq!(args.group_id, "epics/auth");
                assert_eq!(args.subtask_id, "auth-3");
                assert_eq!(args.status.as_deref(), Some("done"));
                assert!(args.dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
