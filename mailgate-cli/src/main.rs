//! Mailgate CLI
//!
//! Operator tooling around the credential vault and the daemon.
//!
//! # Usage
//!
//! ```bash
//! # Seal a downloaded OAuth client file (prompts twice)
//! mailgate encrypt ~/Downloads/client_secret.json --remove-original
//!
//! # Check a password against the sealed client secret
//! mailgate verify-password
//!
//! # Prompt once and start a supervisor whose children inherit the password
//! mailgate launch -- supervisord -n -c supervisord.conf
//!
//! # Talk to a running daemon
//! mailgate perform list_messages --args '{"query": "is:unread"}'
//! mailgate status
//!
//! # After the provider revoked the stored grant
//! mailgate reset
//! ```

mod client;

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use mailgate_core::kdf::RECOMMENDED_MIN_ITERATIONS;
use mailgate_core::propagation::{export_to, scrub_current_process};
use mailgate_core::setup::{open_client_secret, seal_client_secret};
use mailgate_core::{CredentialVault, PasswordSource, Secret};
use mailgate_daemon::DaemonConfig;
use mailgate_daemon::api::StatusResponse;
use mailgate_daemon::config::{load_config, load_config_from};
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use crate::client::DaemonClient;

#[derive(Parser)]
#[command(name = "mailgate")]
#[command(about = "Encrypted credentials and guarded mail access for local tool servers")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal an OAuth client credentials file into the encrypted artifact
    Encrypt {
        /// Downloaded credentials JSON
        input: PathBuf,

        /// Where to write the artifact (defaults to the configured path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing artifact
        #[arg(short, long)]
        force: bool,

        /// Delete the plaintext input after sealing
        #[arg(long)]
        remove_original: bool,
    },

    /// Check that the vault password opens the client secret
    VerifyPassword,

    /// Prompt once and run a supervisor with the password in its environment
    Launch {
        /// Supervisor command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Perform a mail operation through the daemon
    Perform {
        /// Operation name (e.g., list_messages, send_message)
        operation: String,

        /// Operation arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },

    /// Show the daemon's authentication state
    Status,

    /// Make the daemon forget cached credentials and authenticate again on next use
    #[command(alias = "reauth")]
    Reset,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        FmtSubscriber::builder()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Commands::Encrypt {
            input,
            output,
            force,
            remove_original,
        } => block_on(encrypt(&config, &input, output, force, remove_original)),
        Commands::VerifyPassword => block_on(verify_password(&config)),
        Commands::Launch { command } => launch(&config, &command),
        Commands::Perform { operation, args } => block_on(perform(&config, &operation, args.as_deref())),
        Commands::Status => block_on(status(&config)),
        Commands::Reset => block_on(reset(&config)),
    }
}

/// Run `future` on a runtime that is torn down before returning.
fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?
        .block_on(future)
}

fn password_source(config: &DaemonConfig) -> PasswordSource {
    PasswordSource::with_prompt(config.auth.password_env.clone(), mailgate_core::TerminalPrompt)
}

async fn encrypt(
    config: &DaemonConfig,
    input: &Path,
    output: Option<PathBuf>,
    force: bool,
    remove_original: bool,
) -> Result<()> {
    let output = output.unwrap_or_else(|| config.auth.credentials_path.clone());
    if output.exists() && !force {
        bail!("{} already exists; pass --force to overwrite it", output.display());
    }

    let document = std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;

    let iterations = config.auth.kdf_iterations;
    if iterations < RECOMMENDED_MIN_ITERATIONS {
        warn!(
            "KDF iterations {} are below the recommended minimum of {}",
            iterations, RECOMMENDED_MIN_ITERATIONS
        );
        eprintln!(
            "Warning: {} key derivation iterations is below the recommended {}",
            iterations, RECOMMENDED_MIN_ITERATIONS
        );
    }

    let source = password_source(config);
    let password = match source.from_env() {
        Some(password) => {
            info!("Using password from environment variable {}", source.env_var());
            password
        }
        None => source.prompt_new().await?,
    };

    let vault = CredentialVault::with_iterations(iterations);
    let client = seal_client_secret(&vault, &document, &password, &output)?;

    println!("Sealed client {} into {}", client.masked_client_id(), output.display());

    if remove_original {
        std::fs::remove_file(input).with_context(|| format!("Failed to remove {}", input.display()))?;
        println!("Removed plaintext {}", input.display());
    } else {
        println!("The plaintext {} can now be deleted", input.display());
    }
    Ok(())
}

async fn verify_password(config: &DaemonConfig) -> Result<()> {
    let (password, _) = password_source(config).resolve().await?;
    let client = open_client_secret(&config.auth.credentials_path, &password)?;
    println!("Password OK; client id {}", client.masked_client_id());
    Ok(())
}

/// Prompt, verify, spawn the supervisor, scrub, wait, then exit with the
/// supervisor's status.
fn launch(config: &DaemonConfig, command: &[String]) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("missing supervisor command"))?;
    let env_var = config.auth.password_env.clone();

    // The runtime and its blocking pool are gone before the environment is
    // touched below.
    let password: Secret = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?
        .block_on(async {
            let (password, _) = password_source(config).resolve().await?;
            open_client_secret(&config.auth.credentials_path, &password)?;
            Ok::<_, anyhow::Error>(password)
        })?;

    let mut supervisor = Command::new(program);
    supervisor.args(args);
    export_to(&mut supervisor, &env_var, &password);
    drop(password);

    let mut child = supervisor
        .spawn()
        .with_context(|| format!("Failed to start {}", program))?;
    info!("Started {} (pid {})", program, child.id());

    // SAFETY: no runtime or other thread exists at this point.
    unsafe { scrub_current_process(&env_var) };

    let status = child.wait().with_context(|| format!("Failed to wait for {}", program))?;
    info!("{} exited with {}", program, status);
    std::process::exit(exit_code(status));
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

async fn connect(config: &DaemonConfig) -> Result<DaemonClient> {
    let client = DaemonClient::connect(&config.socket_path).await?;
    if !client.is_connected() {
        bail!(
            "Daemon is not running at {}; start it with `mailgate launch -- mailgated`",
            client.socket_path().display()
        );
    }
    Ok(client)
}

async fn perform(config: &DaemonConfig, operation: &str, args: Option<&str>) -> Result<()> {
    let args = match args {
        Some(raw) => serde_json::from_str(raw).context("--args must be a JSON value")?,
        None => serde_json::Value::Null,
    };

    let mut client = connect(config).await?;
    let response = client.perform(operation, args).await?;

    eprintln!("[{}] {}", response.correlation_id, response.operation);
    println!("{}", serde_json::to_string_pretty(&response.result)?);
    Ok(())
}

async fn status(config: &DaemonConfig) -> Result<()> {
    let mut client = connect(config).await?;
    let status = client.status().await?;
    print_status(config, &status)
}

async fn reset(config: &DaemonConfig) -> Result<()> {
    let mut client = connect(config).await?;
    let status = client.reset().await?;

    println!("Cleared cached credentials; the next operation authenticates again");
    print_status(config, &status)
}

fn print_status(config: &DaemonConfig, status: &StatusResponse) -> Result<()> {
    println!("Daemon {} at {}", status.version, config.socket_path.display());
    println!("  State: {}", serde_json::to_value(status.state)?.as_str().unwrap_or("unknown"));
    if let Some(generation) = status.generation {
        println!("  Session generation: {}", generation);
    }
    if let Some(expires_at) = &status.expires_at {
        println!("  Access token expires: {}", expires_at);
    }
    Ok(())
}
