//! msgvault - chunked file storage over a messaging backend

use clap::{Parser, Subcommand};
use msgvault_cli::{commands, CliConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "msgvault")]
#[command(about = "Store files of any size on a messaging backend")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "MSGVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory, overrides the configuration
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Chunk size in bytes, overrides the configuration
    #[arg(long, global = true)]
    chunk_size: Option<u64>,

    /// Passphrase for share-link containers and backups
    #[arg(long, global = true, env = "MSGVAULT_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true, env = "MSGVAULT_DEBUG")]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "MSGVAULT_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store one or more files
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Fetch a stored file
    Download { file_id: String, dest: PathBuf },
    /// Delete a stored file and its remote objects
    Delete { file_id: String },
    /// List stored files
    List,
    /// List incomplete transfers
    Tasks,
    /// Resume every incomplete transfer
    Resume,
    /// Export or import share-link containers
    Share {
        #[command(subcommand)]
        action: ShareCommand,
    },
    /// Export or restore an encrypted backup of every stored file record
    Backup {
        #[command(subcommand)]
        action: BackupCommand,
    },
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Seal all file records into an archive
    Export {
        /// Archive path
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Restore the file records of an archive
    Import { archive: PathBuf },
}

#[derive(Subcommand, Debug)]
enum ShareCommand {
    /// Write an encrypted container describing stored files
    Export {
        #[arg(required = true)]
        file_ids: Vec<String>,
        /// Container path
        #[arg(short, long)]
        out: PathBuf,
        /// Write the container as base64 text
        #[arg(long)]
        armor: bool,
    },
    /// Add the files of a container to this vault
    Import {
        container: PathBuf,
        /// The container is base64 text
        #[arg(long)]
        armor: bool,
    },
}

fn init_logging(args: &Args) {
    let log_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("msgvault={0},msgvault_cli={0},msgvault_core={0}", log_level).into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(args: Args) -> msgvault_cli::Result<()> {
    let mut config = CliConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(size) = args.chunk_size {
        config.chunk_size = size;
    }

    let vault = commands::open_vault(&config).await?;
    let passphrase = args.passphrase.as_deref();
    let outcome = match args.command {
        Command::Upload { paths } => commands::upload(&vault, &paths).await.map(|_| ()),
        Command::Download { file_id, dest } => commands::download(&vault, &file_id, &dest).await,
        Command::Delete { file_id } => commands::delete(&vault, &file_id).await,
        Command::List => commands::list(&vault).await,
        Command::Tasks => commands::tasks(&vault).await,
        Command::Resume => commands::resume(&vault).await,
        Command::Share { action } => match action {
            ShareCommand::Export {
                file_ids,
                out,
                armor,
            } => commands::share_export(&vault, &file_ids, &out, passphrase, armor).await,
            ShareCommand::Import { container, armor } => {
                commands::share_import(&vault, &container, passphrase, armor).await
            }
        },
        Command::Backup { action } => match action {
            BackupCommand::Export { out } => commands::backup_export(&vault, &out, passphrase).await,
            BackupCommand::Import { archive } => {
                commands::backup_import(&vault, &archive, passphrase).await
            }
        },
    };
    vault.shutdown();
    outcome
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(&args);

    if let Err(e) = run(args).await {
        let code = e.exit_code();
        tracing::debug!(error = ?e, "Command failed");
        eprintln!("error: {:#}", anyhow::Error::from(e));
        std::process::exit(code);
    }
}
