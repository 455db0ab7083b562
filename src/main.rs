//! foliosync command-line interface.
//!
//! Commits files to a GitHub branch (or a local repository with `--local`)
//! through the same pipeline the editor uses.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use foliosync::autosave::{AutoSaveScheduler, ConflictDetector, NetworkStatus};
use foliosync::config::SyncConfig;
use foliosync::pipeline::{CommitOptions, CommitPipeline, FileChange};
use foliosync::ratelimit::RequestGate;
use foliosync::remote::{GitDataApi, GitHubClient};
use foliosync::storage::LocalRemote;
use foliosync::types::{BranchName, CommitSha, RepoId, RepoTarget};

#[derive(Parser)]
#[command(
    name = "foliosync",
    version = env!("CARGO_PKG_VERSION"),
    about = "Atomic commits and autosave for GitHub-hosted portfolio content"
)]
struct Cli {
    #[command(flatten)]
    repo: RepoArgs,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RepoArgs {
    /// Repository owner
    #[arg(long, env = "FOLIOSYNC_OWNER", global = true)]
    owner: Option<String>,

    /// Repository name
    #[arg(long, env = "FOLIOSYNC_REPO", global = true)]
    repo: Option<String>,

    /// Branch to read and write
    #[arg(long, short, default_value = "main", global = true)]
    branch: String,

    /// Use a local git repository instead of GitHub (takes precedence)
    #[arg(long, value_name = "PATH", global = true)]
    local: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Commit a batch of file changes atomically
    Commit {
        /// Commit message
        #[arg(short, long)]
        message: String,

        /// Add a new file: REPO_PATH=LOCAL_FILE
        #[arg(long, value_name = "REPO_PATH=FILE", value_parser = parse_assignment)]
        create: Vec<(String, PathBuf)>,

        /// Replace a file: REPO_PATH=LOCAL_FILE
        #[arg(long, value_name = "REPO_PATH=FILE", value_parser = parse_assignment)]
        update: Vec<(String, PathBuf)>,

        /// Remove a file
        #[arg(long, value_name = "REPO_PATH")]
        delete: Vec<String>,

        /// Snapshot the branch to a backup branch first
        #[arg(long)]
        backup: bool,

        /// Refuse to commit unless the branch is at this commit
        #[arg(long, value_name = "SHA")]
        expect: Option<String>,
    },

    /// Save a JSON document through the autosave loop, with conflict check
    Save {
        /// JSON file to save
        file: PathBuf,

        /// Repository path to write (defaults to the configured data path)
        #[arg(long)]
        path: Option<String>,
    },

    /// Print the branch tip
    Tip,

    /// Print a file at the branch tip
    Cat {
        /// Repository path
        path: String,
    },

    /// Create a branch at the current tip
    Branch {
        /// New branch name
        name: String,
    },

    /// Open a pull request into the branch
    Pr {
        /// Branch with the changes
        #[arg(long)]
        head: String,

        #[arg(long)]
        title: String,

        #[arg(long)]
        body: Option<String>,
    },

    /// Show the rate limit quota after one probe call
    Quota,
}

fn parse_assignment(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((path, file)) if !path.is_empty() && !file.is_empty() => {
            Ok((path.to_string(), PathBuf::from(file)))
        }
        _ => Err(format!("expected REPO_PATH=FILE, got {:?}", raw)),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "foliosync=debug"
    } else {
        "foliosync=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

struct Session {
    config: SyncConfig,
    api: Arc<dyn GitDataApi>,
    gate: Arc<RequestGate>,
    target: RepoTarget,
}

impl Session {
    fn open(args: &RepoArgs) -> Result<Self, String> {
        let config = SyncConfig::from_env().map_err(|e| e.to_string())?;
        let branch = BranchName::new(args.branch.as_str()).map_err(|e| e.to_string())?;

        let (api, repo): (Arc<dyn GitDataApi>, RepoId) = match &args.local {
            Some(path) => {
                let remote = LocalRemote::open_or_init(path, &branch).map_err(|e| e.to_string())?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "local".to_string());
                debug!(path = %path.display(), "using local repository");
                (Arc::new(remote), RepoId::new("local", name))
            }
            None => {
                let (Some(owner), Some(repo)) = (&args.owner, &args.repo) else {
                    return Err("--owner and --repo are required unless --local is given".to_string());
                };
                let client = GitHubClient::new(&config.remote).map_err(|e| e.to_string())?;
                (Arc::new(client), RepoId::new(owner.as_str(), repo.as_str()))
            }
        };

        let gate = Arc::new(RequestGate::from_config(&config.retry, config.remote.call_timeout));
        Ok(Self {
            config,
            api,
            gate,
            target: RepoTarget::new(repo, branch),
        })
    }

    fn pipeline(&self) -> CommitPipeline {
        CommitPipeline::new(self.api.clone(), self.gate.clone(), self.config.pipeline.clone())
    }
}

fn read_changes(
    create: Vec<(String, PathBuf)>,
    update: Vec<(String, PathBuf)>,
    delete: Vec<String>,
) -> Result<Vec<FileChange>, String> {
    let mut changes = Vec::new();
    for (path, file) in create {
        let content = std::fs::read(&file).map_err(|e| format!("{}: {}", file.display(), e))?;
        changes.push(FileChange::create(path, content));
    }
    for (path, file) in update {
        let content = std::fs::read(&file).map_err(|e| format!("{}: {}", file.display(), e))?;
        changes.push(FileChange::update(path, content));
    }
    changes.extend(delete.into_iter().map(FileChange::delete));
    Ok(changes)
}

async fn run(cli: Cli) -> Result<(), String> {
    let session = Session::open(&cli.repo)?;
    let target = &session.target;

    match cli.command {
        Commands::Commit {
            message,
            create,
            update,
            delete,
            backup,
            expect,
        } => {
            let changes = read_changes(create, update, delete)?;
            let mut options = CommitOptions::new();
            if backup {
                options = options.with_backup(true);
            }
            if let Some(sha) = expect {
                options = options.expect_parent(CommitSha::from_hex(&sha).map_err(|e| e.to_string())?);
            }

            let result = session
                .pipeline()
                .create_commit(target, &changes, &message, &options)
                .await
                .map_err(|e| e.to_string())?;
            println!(
                "{} {} -> {} ({} file(s))",
                target,
                result.parent_sha.short(),
                result.commit_sha,
                result.files_changed
            );
        }

        Commands::Save { file, path } => {
            let raw = std::fs::read(&file).map_err(|e| format!("{}: {}", file.display(), e))?;
            let data: serde_json::Value = serde_json::from_slice(&raw)
                .map_err(|e| format!("{}: {}", file.display(), e))?;

            let mut autosave = session.config.autosave.clone();
            if let Some(path) = path {
                autosave.data_path = path;
            }
            let pipeline = session.pipeline();
            let detector = ConflictDetector::new(session.api.clone(), session.gate.clone());
            let scheduler = AutoSaveScheduler::new(
                target.clone(),
                pipeline,
                detector,
                Arc::new(NetworkStatus::default()),
                autosave,
            )
            .map_err(|e| e.to_string())?;

            scheduler.sync().await.map_err(|e| e.to_string())?;
            match scheduler.force_save(data).await.map_err(|e| e.user_reason())? {
                Some(result) => println!("saved {}", result.commit_sha),
                None => println!("nothing to save"),
            }
        }

        Commands::Tip => {
            let tip = session
                .pipeline()
                .resolve_tip(target)
                .await
                .map_err(|e| e.to_string())?;
            println!("{} {} tree {}", target, tip.commit_sha, tip.tree_sha);
        }

        Commands::Cat { path } => {
            let content = session
                .pipeline()
                .read_file(target, &path)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("{} not found on {}", path, target))?;
            print!("{}", String::from_utf8_lossy(&content));
        }

        Commands::Branch { name } => {
            let branch = BranchName::new(name).map_err(|e| e.to_string())?;
            let tip = session
                .pipeline()
                .create_branch(target, &branch)
                .await
                .map_err(|e| e.to_string())?;
            println!("{} at {}", tip.branch, tip.commit_sha);
        }

        Commands::Pr { head, title, body } => {
            let head = BranchName::new(head).map_err(|e| e.to_string())?;
            let pull = session
                .pipeline()
                .open_pull_request(target, &head, &title, body.as_deref())
                .await
                .map_err(|e| e.to_string())?;
            println!("#{} {}", pull.number, pull.html_url);
        }

        Commands::Quota => {
            session
                .pipeline()
                .resolve_tip(target)
                .await
                .map_err(|e| e.to_string())?;
            let state = session.gate.snapshot();
            let json = serde_json::to_string_pretty(&state).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
