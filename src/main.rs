use std::ffi::OsString;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use bstr::{BString, ByteSlice, ByteVec};
use clap::{Parser, Subcommand};

use restack::config::RestackConfig;
use restack::merge_tree::{MergeOutcome, merge_tree};
use restack::telemetry::{self, LogFormat};
use restack::tree_patch::{UpdateTreeRequest, update_tree};
use restack_git::{
    BlobInfo, ConflictStyle, GitCli, GitError, Hash, ListTreeOptions, MergeTreeRequest,
    ObjectStore, TreeEntry,
};

/// Plumbing for stacked branches
///
/// Edits trees and merges branches directly in git's object store, without
/// a working tree or index. Every command prints object ids on stdout so it
/// composes with `git commit-tree` and `git update-ref`.
#[derive(Parser)]
#[command(name = "restack")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'restack <command> --help' for more information on a specific command.")]
struct Cli {
    /// Run as if started in <DIR>
    #[arg(short = 'C', global = true, value_name = "DIR", default_value = ".")]
    dir: PathBuf,

    /// Configuration file (missing file means defaults)
    #[arg(long, global = true, env = "RESTACK_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log output format (filter with RUST_LOG)
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply blob writes and path deletes to a tree
    ///
    /// Prints the new tree id. Only directories on an edited path are
    /// rewritten; directories left empty are removed.
    UpdateTree {
        /// Base tree or commit (an all-zero id means the empty tree)
        tree: String,

        /// Place a blob: <mode>:<hash>:<path>
        #[arg(long = "write", value_name = "MODE:HASH:PATH", value_parser = parse_write)]
        writes: Vec<BlobInfo>,

        /// Remove a path (missing paths are ignored)
        #[arg(long = "delete", value_name = "PATH")]
        deletes: Vec<OsString>,
    },

    /// Build one tree level from `ls-tree` style records on stdin
    ///
    /// Prints the new tree id. Records are newline-terminated unless -z is
    /// given.
    Mktree {
        /// Records are NUL-terminated
        #[arg(short = 'z')]
        nul: bool,
    },

    /// List the entries of a tree
    LsTree {
        /// Tree or commit
        tree: String,

        /// Recurse into subtrees, listing blobs with full paths
        #[arg(short = 'r')]
        recurse: bool,

        /// NUL-terminate records
        #[arg(short = 'z')]
        nul: bool,
    },

    /// Merge two branches without touching the working tree
    ///
    /// Prints the merged tree id. On conflict, also prints the conflicted
    /// stages and git's messages, then exits with status 1.
    MergeTree {
        /// The branch being merged into
        branch1: String,

        /// The branch being merged
        branch2: String,

        /// Use this commit or tree as the merge base
        #[arg(long, value_name = "REV")]
        merge_base: Option<String>,

        /// Conflict marker style (overrides the config file)
        #[arg(long, value_name = "STYLE")]
        conflict_style: Option<ConflictStyle>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format);

    let config = match &cli.config {
        Some(path) => RestackConfig::load(path)?,
        None => RestackConfig::default(),
    };
    let git = config.git_cli(&cli.dir);

    match cli.command {
        Commands::UpdateTree {
            tree,
            writes,
            deletes,
        } => run_update_tree(&git, &tree, writes, deletes),
        Commands::Mktree { nul } => run_mktree(&git, nul),
        Commands::LsTree { tree, recurse, nul } => run_ls_tree(&git, &tree, recurse, nul),
        Commands::MergeTree {
            branch1,
            branch2,
            merge_base,
            conflict_style,
            json,
        } => {
            let request = MergeTreeRequest {
                branch1,
                branch2,
                merge_base,
                conflict_style: conflict_style.or(config.merge.conflict_style),
            };
            run_merge_tree(&git, &request, json)
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn run_update_tree(
    git: &GitCli,
    tree: &str,
    writes: Vec<BlobInfo>,
    deletes: Vec<OsString>,
) -> Result<ExitCode> {
    let deletes = deletes
        .into_iter()
        .map(|path| {
            Vec::from_os_string(path)
                .map(BString::from)
                .map_err(|path| anyhow!("cannot delete {}: path has no byte form here", path.to_string_lossy()))
        })
        .collect::<Result<Vec<_>>>()?;
    let base = resolve_tree(git, tree)?;
    let request = UpdateTreeRequest {
        base,
        writes,
        deletes,
    };
    let hash = update_tree(git, &request)
        .with_context(|| format!("updating tree {}", base.short()))?;
    println!("{hash}");
    Ok(ExitCode::SUCCESS)
}

fn run_mktree(git: &GitCli, nul: bool) -> Result<ExitCode> {
    let stdin = io::stdin().lock();
    let mut records = stdin
        .split(if nul { b'\0' } else { b'\n' })
        .filter(|record| !record.as_ref().is_ok_and(Vec::is_empty))
        .map(|record| parse_record(&record?));
    let (hash, count) = git
        .make_tree(&mut records)
        .context("building tree from stdin")?;
    tracing::debug!(%hash, entries = count, "mktree");
    println!("{hash}");
    Ok(ExitCode::SUCCESS)
}

fn run_ls_tree(git: &GitCli, tree: &str, recurse: bool, nul: bool) -> Result<ExitCode> {
    let hash = resolve_tree(git, tree)?;
    let mut listing = git
        .list_tree(hash, ListTreeOptions { recurse })
        .with_context(|| format!("listing {tree}"))?;
    let terminator = if nul { b'\0' } else { b'\n' };
    let mut out = BufWriter::new(io::stdout().lock());
    for entry in &mut listing {
        let entry = entry.with_context(|| format!("listing {tree}"))?;
        entry.write_record(&mut out)?;
        out.write_all(&[terminator])?;
    }
    listing.close()?;
    out.flush()?;
    Ok(ExitCode::SUCCESS)
}

fn run_merge_tree(git: &GitCli, request: &MergeTreeRequest, json: bool) -> Result<ExitCode> {
    let outcome = merge_tree(git, request).with_context(|| {
        format!("merging {} into {}", request.branch2, request.branch1)
    })?;

    let mut out = BufWriter::new(io::stdout().lock());
    if json {
        serde_json::to_writer_pretty(&mut out, &outcome)?;
        writeln!(out)?;
    } else {
        writeln!(out, "{}", outcome.tree())?;
        if let MergeOutcome::Conflicted(conflict) = &outcome {
            writeln!(out)?;
            for file in &conflict.files {
                write!(out, "{} {} {}\t", file.mode, file.object, file.stage)?;
                out.write_all(&file.path)?;
                writeln!(out)?;
            }
            writeln!(out)?;
            for note in &conflict.annotations {
                out.write_all(note.message.trim_end())?;
                writeln!(out)?;
            }
        }
    }
    out.flush()?;

    if let Some(conflict) = outcome.conflict() {
        eprintln!("{conflict}");
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

/// Resolve a tree argument. An all-zero id is the absent tree and is not
/// looked up.
fn resolve_tree(git: &GitCli, rev: &str) -> Result<Hash> {
    if let Ok(hash) = rev.parse::<Hash>()
        && hash.is_zero()
    {
        return Ok(Hash::ZERO);
    }
    git.peel_to_tree(rev)
        .with_context(|| format!("resolving {rev} to a tree"))
}

/// Parse `<mode>:<hash>:<path>`. The path may itself contain `:`.
fn parse_write(arg: &str) -> Result<BlobInfo, String> {
    let mut parts = arg.splitn(3, ':');
    let (Some(mode), Some(hash), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected <mode>:<hash>:<path>, got {arg:?}"));
    };
    Ok(BlobInfo {
        mode: mode.parse().map_err(|e| format!("{e}"))?,
        hash: hash.parse().map_err(|e| format!("{e}"))?,
        path: path.into(),
    })
}

fn parse_record(record: &[u8]) -> Result<TreeEntry, GitError> {
    TreeEntry::parse_record(record).map_err(|reason| GitError::InvalidEntry {
        name: record.as_bstr().to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use restack_git::Mode;

    #[test]
    fn write_arg_keeps_colons_in_path() {
        let blob = parse_write("100755:e69de29bb2d1d6434b8b29ae775ad8c2e48c5391:bin/a:b").unwrap();
        assert_eq!(blob.mode, Mode::Executable);
        assert_eq!(blob.path, "bin/a:b");
        assert!(parse_write("100644:e69de29b").is_err());
        assert!(parse_write("644:e69de29b:x").is_err());
    }

    #[test]
    fn record_errors_are_invalid_entries() {
        let err = parse_record(b"100644 blob nothex\tx").unwrap_err();
        assert!(matches!(err, GitError::InvalidEntry { .. }), "{err}");
    }

    #[test]
    fn records_may_name_latin1_files() {
        let entry = parse_record(b"100644 blob e69de29bb2d1d6434b8b29ae775ad8c2e48c5391\tcaf\xe9").unwrap();
        assert_eq!(entry.name, &b"caf\xe9"[..]);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
