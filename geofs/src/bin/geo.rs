//! `geo`: operate a preservation-first volume from the command line.
//!
//! The mutating verbs are exactly `write`, `hide`, `snapshot` and
//! `switch`. There is no `rm`; there never will be.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use geofs::governor::{Capability, Decision};
use geofs::{Kernel, KernelOptions, ViewId};

#[derive(Parser)]
#[command(
    name = "geo",
    version,
    about = "Preservation-first storage: nothing is ever destroyed"
)]
struct Cli {
    /// Kernel home directory (default: $GEOFS_HOME or the platform data dir)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the volume and seal the bedrock view
    Init {
        /// Advisory logical byte budget
        #[arg(long)]
        quota: Option<u64>,
    },
    /// Record content at a path in the working view
    Write {
        path: String,
        /// Read content from a file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print content at the current view (or an explicit one)
    Cat {
        path: String,
        #[arg(long)]
        view: Option<u64>,
    },
    /// List a directory at the current view
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Make a path absent from the present, keeping all history
    Hide { path: String },
    /// Seal the working view under a label
    Snapshot { label: String },
    /// Bind reads to a sealed view
    Switch { view: u64 },
    /// List sealed views in creation order
    Views,
    /// Volume statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Submit a payload for governor evaluation
    Submit {
        file: PathBuf,
        /// Declared capabilities, e.g. "storage-read,snapshot"
        #[arg(long, default_value = "")]
        caps: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// List governor audit records
    Audit,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut options = KernelOptions::default();
    if let Some(home) = cli.home {
        options.home_dir = home;
    }
    if let Command::Init { quota } = &cli.command {
        options.quota_bytes = *quota;
    }

    let kernel = Kernel::bootstrap(options).context("failed to bring up the kernel context")?;
    let volume = kernel.volume();

    match cli.command {
        Command::Init { .. } => {
            println!(
                "volume ready at {} ({} views)",
                volume.layout().root().display(),
                volume.list_views().len()
            );
        }
        Command::Write { path, file } => {
            let content = match file {
                Some(file) => std::fs::read(&file)
                    .with_context(|| format!("reading {}", file.display()))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            volume.write(&path, &content)?;
            println!("recorded {} ({} bytes)", path, content.len());
        }
        Command::Cat { path, view } => {
            let bytes = match view {
                Some(id) => volume.read_at(ViewId(id), &path)?,
                None => volume.read(&path)?,
            };
            std::io::stdout().write_all(&bytes)?;
        }
        Command::Ls { path } => {
            for (name, entry) in volume.list(&path)? {
                println!("{:9} {:>8}  {}", format!("{:?}", entry.kind), entry.size, name);
            }
        }
        Command::Hide { path } => {
            volume.hide(&path)?;
            println!("hidden: {path} (history preserved)");
        }
        Command::Snapshot { label } => {
            let view = volume.snapshot(&label)?;
            println!("sealed {view} as {label:?}");
        }
        Command::Switch { view } => {
            volume.switch(ViewId(view))?;
            println!("reads bound to v{view}");
        }
        Command::Views => {
            for record in volume.list_views() {
                let parent = record
                    .parent
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>6}  parent {:>6}  {}  {}",
                    record.id.to_string(),
                    parent,
                    record.created.to_rfc3339(),
                    record.label
                );
            }
        }
        Command::Stats { json } => {
            let stats = volume.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("views         {}", stats.views);
                println!("refs          {}", stats.refs);
                println!("unique blobs  {}", stats.unique_blobs);
                println!("bytes stored  {}", stats.bytes_stored);
                println!("dedup savings {}", stats.dedup_savings);
            }
        }
        Command::Submit { file, caps, actor } => {
            let code =
                std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let requested = Capability::parse_list(&caps)?;
            let submission = kernel.governor().submit(&code, requested, &actor)?;
            match submission.decision {
                Decision::Approve { granted } => {
                    println!(
                        "approved (record {:08}); granted: {}",
                        submission.record_id,
                        granted.describe()
                    );
                }
                Decision::Decline { reason } => {
                    println!(
                        "declined (record {:08}); reason: {}",
                        submission.record_id,
                        reason.code()
                    );
                }
                Decision::Modify { substitute } => {
                    println!(
                        "modified (record {:08}); substitute is {} bytes",
                        submission.record_id,
                        substitute.len()
                    );
                }
            }
        }
        Command::Audit => {
            for record in kernel.governor().records()? {
                let prior = record
                    .prior
                    .map(|p| format!(" cites {p:08}"))
                    .unwrap_or_default();
                println!(
                    "{:08}  {:7}  {}  {}  requested [{}] granted [{}]{}{}",
                    record.id,
                    record.decision.as_str(),
                    record.created.to_rfc3339(),
                    record.code_digest,
                    record.requested.describe(),
                    record.granted.describe(),
                    if record.reason.is_empty() {
                        String::new()
                    } else {
                        format!("  {}", record.reason)
                    },
                    prior
                );
            }
        }
    }

    Ok(())
}
