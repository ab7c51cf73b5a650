//! tokensync - drive cross-process token cache synchronization from the command line.

mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use client_cache::ScopeRequest;
use tokensync_config_and_utils::{init_logging, Config, Paths};

/// tokensync command-line interface.
#[derive(Parser)]
#[command(name = "tokensync")]
#[command(about = "Keep token-client caches in sync across processes sharing one secret store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, logs). Defaults to ~/.tokensync
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run several simulated processes over one in-memory store
    Simulate {
        /// Number of processes attached to the store
        #[arg(short, long, default_value_t = 2)]
        processes: usize,

        /// Accounts signed in through the first process
        #[arg(short, long, default_values_t = ["alice".to_string(), "bob".to_string()])]
        accounts: Vec<String>,
    },
    /// Show how a scope list selects client, tenant and authority
    Scopes {
        /// Scopes, including VSCODE_CLIENT_ID:<id> and VSCODE_TENANT:<tenant> markers
        #[arg(required = true)]
        scopes: Vec<String>,
    },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration back to the config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;

    // Initialize logging
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));

    match cli.command {
        Some(Commands::Simulate {
            processes,
            accounts,
        }) => {
            simulate::run(&config, processes, &accounts).await?;
        }
        None => {
            simulate::run(&config, 2, &["alice".to_string()]).await?;
        }
        Some(Commands::Scopes { scopes }) => {
            let request =
                ScopeRequest::parse(&scopes, &config.default_client_id, &config.default_tenant);
            let authority = request.authority(&config.authority_host()?)?;
            println!("client_id: {}", request.client_id);
            println!("tenant:    {}", request.tenant);
            println!("authority: {authority}");
            println!("scopes:    {}", request.scopes_to_send().join(" "));
        }
        Some(Commands::Config { save }) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save(&paths)?;
                println!("Saved to {}", paths.config_file().display());
            }
        }
    }

    Ok(())
}
