use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use env_logger::Env;
use log::debug;
use mdpatch::core::{ElementKind, normalize_line_endings};
use mdpatch::search::MatchType;
use mdpatch::{
    BacklinkOptions, EditOutcome, EditRequest, FsVault, NoteStore, RawEdit, SearchHit,
    StructuralElement, VaultConfig, parse_document, process_vault, read_many, search,
};
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(
    name = "mdpatch",
    about = "Structural edits and automatic wikilinks for markdown vaults",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Vault root directory. Defaults to ./vault.
    #[arg(long, global = true, env = "MDPATCH_VAULT")]
    vault: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List documents in the vault.
    List(ListArgs),

    /// Print one or more documents.
    Read(ReadArgs),

    /// Create a document.
    Create(CreateArgs),

    /// Print the structural elements of a document.
    Outline(OutlineArgs),

    /// Apply a batch of edits to a document.
    Edit(EditArgs),

    /// Link mentions of document names across the vault.
    Backlink(BacklinkArgs),

    /// Delete a document.
    Delete(DeleteArgs),

    /// Move or rename a document.
    Move(MoveArgs),

    /// Create, move or delete folders.
    #[command(subcommand)]
    Folder(FolderCommand),

    /// Find documents whose path or text contains a query.
    Search(SearchArgs),
}

#[derive(Debug, Subcommand)]
enum FolderCommand {
    /// Create a folder and any missing parents.
    Create { path: String },
    /// Rename a folder in place.
    Rename { path: String, new_path: String },
    /// Move a folder under another location.
    Move { path: String, new_path: String },
    /// Delete a folder and everything in it.
    Delete { path: String },
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Folder to list, relative to the vault root.
    folder: Option<String>,
    /// Only list direct children of the folder.
    #[arg(long)]
    no_recursive: bool,
    /// Emit JSON instead of one path per line.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ReadArgs {
    /// Documents to print. Several paths are printed one after another, separated by `---`.
    #[arg(required = true)]
    paths: Vec<String>,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("source").required(true).args(["content", "from"])))]
struct CreateArgs {
    path: String,
    /// Document text.
    #[arg(long)]
    content: Option<String>,
    /// Read the document text from this file.
    #[arg(long)]
    from: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct OutlineArgs {
    path: String,
    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct EditArgs {
    path: String,
    /// JSON file holding the edit list, or `-` for stdin.
    #[arg(long)]
    edits: PathBuf,
    /// Print a unified diff instead of writing.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct BacklinkArgs {
    /// Write the links. Without this flag only a preview is printed.
    #[arg(long)]
    apply: bool,
    /// Skip documents whose path matches this pattern (`*` matches anything). Repeatable.
    #[arg(long = "exclude")]
    exclude: Vec<String>,
    /// Shortest document name considered for linking.
    #[arg(long, default_value_t = 3)]
    min_length: usize,
    #[arg(long)]
    case_sensitive: bool,
    /// Also match names that are not delimited by word boundaries.
    #[arg(long)]
    partial_words: bool,
    /// Documents per batch.
    #[arg(long, default_value_t = 50)]
    batch_size: usize,
    /// Emit the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    path: String,
}

#[derive(Debug, Args)]
struct MoveArgs {
    from: String,
    to: String,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    /// Emit JSON instead of one hit per line.
    #[arg(long)]
    json: bool,
}

/// Edit lists come either bare or wrapped as `{"edits": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EditsInput {
    List(Vec<RawEdit>),
    Batch { edits: Vec<RawEdit> },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = VaultConfig::load(cli.vault).context("resolving vault root")?;
    debug!(
        "vault {:?} with {} exclusion(s)",
        config.root,
        config.exclusions.len()
    );
    let vault = FsVault::new(config);
    match cli.command {
        Commands::List(args) => handle_list(args, &vault),
        Commands::Read(args) => handle_read(args, &vault),
        Commands::Create(args) => handle_create(args, &vault),
        Commands::Outline(args) => handle_outline(args, &vault),
        Commands::Edit(args) => handle_edit(args, &vault),
        Commands::Backlink(args) => handle_backlink(args, &vault),
        Commands::Delete(args) => handle_delete(args, &vault),
        Commands::Move(args) => handle_move(args, &vault),
        Commands::Folder(command) => handle_folder(command, &vault),
        Commands::Search(args) => handle_search(args, &vault),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default)).init();
}

fn handle_list(args: ListArgs, vault: &FsVault) -> Result<()> {
    let ListArgs {
        folder,
        no_recursive,
        json,
    } = args;
    let files = vault
        .list(folder.as_deref(), !no_recursive)
        .with_context(|| format!("listing {:?}", folder.as_deref().unwrap_or("/")))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
    } else {
        for file in files {
            println!("{file}");
        }
    }
    Ok(())
}

fn handle_read(args: ReadArgs, vault: &FsVault) -> Result<()> {
    let text = match args.paths.as_slice() {
        [path] => vault
            .read(path)
            .with_context(|| format!("reading {path}"))?,
        paths => read_many(vault, paths),
    };
    print!("{text}");
    if !text.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn handle_create(args: CreateArgs, vault: &FsVault) -> Result<()> {
    let CreateArgs {
        path,
        content,
        from,
    } = args;
    let text = match (content, from) {
        (Some(text), _) => text,
        (None, Some(source)) => fs::read_to_string(&source)
            .with_context(|| format!("reading {:?}", source))?,
        (None, None) => anyhow::bail!("either --content or --from is required"),
    };
    vault
        .create(&path, &text)
        .with_context(|| format!("creating {path}"))?;
    println!("Created {path}");
    Ok(())
}

fn handle_outline(args: OutlineArgs, vault: &FsVault) -> Result<()> {
    let text = vault
        .read(&args.path)
        .with_context(|| format!("reading {}", args.path))?;
    let elements = parse_document(&normalize_line_endings(&text));
    if args.json {
        println!("{}", serde_json::to_string_pretty(&elements)?);
    } else {
        for element in &elements {
            println!("{}", format_element(element));
        }
    }
    Ok(())
}

fn handle_edit(args: EditArgs, vault: &FsVault) -> Result<()> {
    let EditArgs {
        path,
        edits,
        dry_run,
    } = args;
    let edits = read_edits(&edits)?;
    let outcome = EditRequest::new(path.clone(), edits, dry_run)
        .execute(vault)
        .with_context(|| format!("editing {path}"))?;
    match outcome {
        EditOutcome::Preview(diff) => print!("{diff}"),
        written => println!("{written}"),
    }
    Ok(())
}

fn handle_backlink(args: BacklinkArgs, vault: &FsVault) -> Result<()> {
    let json = args.json;
    let options = backlink_options(args);
    let report = process_vault(vault, &options).context("linking vault documents")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}

fn handle_delete(args: DeleteArgs, vault: &FsVault) -> Result<()> {
    vault
        .delete(&args.path)
        .with_context(|| format!("deleting {}", args.path))?;
    println!("Deleted {}", args.path);
    Ok(())
}

fn handle_move(args: MoveArgs, vault: &FsVault) -> Result<()> {
    let MoveArgs { from, to } = args;
    vault
        .rename(&from, &to)
        .with_context(|| format!("moving {from} to {to}"))?;
    println!("Moved {from} to {to}");
    Ok(())
}

fn handle_folder(command: FolderCommand, vault: &FsVault) -> Result<()> {
    match command {
        FolderCommand::Create { path } => {
            vault
                .create_folder(&path)
                .with_context(|| format!("creating folder {path}"))?;
            println!("Created folder {path}");
        }
        FolderCommand::Rename { path, new_path } | FolderCommand::Move { path, new_path } => {
            vault
                .rename_folder(&path, &new_path)
                .with_context(|| format!("moving folder {path} to {new_path}"))?;
            println!("Moved folder {path} to {new_path}");
        }
        FolderCommand::Delete { path } => {
            vault
                .delete_folder(&path)
                .with_context(|| format!("deleting folder {path}"))?;
            println!("Deleted folder {path}");
        }
    }
    Ok(())
}

fn handle_search(args: SearchArgs, vault: &FsVault) -> Result<()> {
    let hits = search(vault, &args.query).with_context(|| format!("searching {:?}", args.query))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else if hits.is_empty() {
        println!("No matches for {:?}", args.query);
    } else {
        for hit in &hits {
            println!("{}", format_hit(hit));
        }
    }
    Ok(())
}

fn format_hit(hit: &SearchHit) -> String {
    let kind = match hit.match_type {
        MatchType::Filename => "filename",
        MatchType::Content => "content",
    };
    match hit.line {
        Some(line) => format!("{} (score {}, {kind}, line {})", hit.path, hit.score, line + 1),
        None => format!("{} (score {}, {kind})", hit.path, hit.score),
    }
}

fn backlink_options(args: BacklinkArgs) -> BacklinkOptions {
    BacklinkOptions {
        dry_run: !args.apply,
        exclude_patterns: args.exclude,
        min_length: args.min_length,
        case_sensitive: args.case_sensitive,
        whole_words: !args.partial_words,
        batch_size: args.batch_size,
    }
}

fn read_edits(source: &Path) -> Result<Vec<RawEdit>> {
    let raw = if source == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("reading edits from stdin")?;
        buf
    } else {
        fs::read_to_string(source).with_context(|| format!("reading {:?}", source))?
    };
    parse_edits(&raw).with_context(|| format!("parsing edits from {:?}", source))
}

fn parse_edits(raw: &str) -> Result<Vec<RawEdit>> {
    let input: EditsInput = serde_json::from_str(raw)?;
    let edits = match input {
        EditsInput::List(edits) | EditsInput::Batch { edits } => edits,
    };
    if edits.is_empty() {
        anyhow::bail!("edit list is empty");
    }
    Ok(edits)
}

fn format_element(element: &StructuralElement) -> String {
    let span = if element.start_line == element.end_line {
        format!("{}", element.start_line)
    } else {
        format!("{}-{}", element.start_line, element.end_line)
    };
    let kind = match (element.kind, element.level) {
        (ElementKind::Heading, Some(level)) => format!("h{level}"),
        (kind, _) => kind.as_str().to_string(),
    };
    let first_line = element.text.lines().next().unwrap_or("");
    let id = element
        .block_id
        .as_deref()
        .map(|id| format!("  ^{id}"))
        .unwrap_or_default();
    format!("{span:>7}  {kind:<9} {first_line}{id}")
}
