//! anemone: operator CLI
//!
//! Commands:
//!   manifest build|show|diff   - build share manifests, inspect and compare them
//!   restore                    - pull a backed-up share back from a peer
//!   peer list|test             - list configured peers, check reachability
//!   key generate|wrap|unwrap|rewrap|verify
//!                              - per-user data key tooling
//!   encrypt / decrypt          - offline file encryption with a user's data key
//!   password hash|wrap         - login password hashing, SMB password wrapping
//!   config show                - display current configuration

use anemone_core::config::AnemoneConfig;
use anemone_core::{ConfigRegistry, Peer, ShareRegistry, UserRecord};
use anemone_crypto::{DataKey, DEFAULT_CHUNK_SIZE};
use anemone_peer::{PeerClient, PeerClientConfig};
use anemone_sync::manifest::manifest_path;
use anemone_sync::{
    format_size, EngineOptions, Manifest, ManifestEngine, ManifestScheduler, PeerRestore,
    RestoreOptions, RestoreProgress, RestoreRequest,
};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "anemone",
    version,
    about = "Anemone share manifest and restore tool",
    long_about = "anemone: build share manifests, restore shares from peers, and manage encryption keys"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "ANEMONE_CONFIG",
        default_value = "/etc/anemone/config.toml"
    )]
    config: PathBuf,

    /// Log level for diagnostics on stderr
    #[arg(long, env = "ANEMONE_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Share manifests
    Manifest {
        #[command(subcommand)]
        action: ManifestAction,
    },

    /// Restore a share from the copy held by a peer
    ///
    /// The destination is the local share registered for (user, share);
    /// files are written into its directory.
    Restore {
        /// Peer name or numeric id
        #[arg(long, short = 'p')]
        peer: String,
        /// Owner of the share
        #[arg(long, short = 'u')]
        user: i64,
        /// Share name (e.g. backup_alice)
        #[arg(long, short = 's')]
        share: String,
        /// Name under which this instance's backups are stored on the peer
        #[arg(long, env = "ANEMONE_SERVER_NAME")]
        source_server: String,
        /// Leave restored paths owned by the invoking user
        #[arg(long)]
        no_chown: bool,
    },

    /// Remote peers
    Peer {
        #[command(subcommand)]
        action: PeerAction,
    },

    /// Per-user data keys
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Encrypt a file with a user's data key
    Encrypt {
        src: PathBuf,
        dst: PathBuf,
        #[arg(long, short = 'u')]
        user: i64,
        /// Plaintext bytes per authenticated chunk
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Decrypt a file produced by `encrypt` or fetched from a peer
    Decrypt {
        src: PathBuf,
        dst: PathBuf,
        #[arg(long, short = 'u')]
        user: i64,
    },

    /// Passwords
    Password {
        #[command(subcommand)]
        action: PasswordAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ManifestAction {
    /// Build and persist manifests for configured shares
    Build {
        /// Only this share (default: every configured share)
        share: Option<String>,
        /// Owner of the share, when several users have one with the same name
        #[arg(long, short = 'u')]
        user: Option<i64>,
    },

    /// Print a manifest
    Show {
        /// Share directory or manifest file
        path: PathBuf,
        /// List every file entry
        #[arg(long)]
        files: bool,
    },

    /// Compare two manifests
    Diff {
        /// Older manifest (share directory or manifest file)
        old: PathBuf,
        /// Newer manifest (share directory or manifest file)
        new: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum PeerAction {
    /// List configured peers
    List,
    /// Check that a peer answers on /health
    Test {
        /// Peer name or numeric id
        peer: String,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Generate a data key and print its wrapped form for a [[users]] entry
    Generate,
    /// Wrap an existing base64 data key under the master key
    Wrap {
        /// Base64 data key
        #[arg(long, env = "ANEMONE_DATA_KEY", hide_env_values = true)]
        key: String,
    },
    /// Print a user's unwrapped data key (base64)
    Unwrap {
        #[arg(long, short = 'u')]
        user: i64,
    },
    /// Re-wrap a user's data key under a new master key
    Rewrap {
        #[arg(long, short = 'u')]
        user: i64,
        /// File holding the new master key (prompted when omitted)
        #[arg(long)]
        new_master_key_file: Option<PathBuf>,
    },
    /// Check a user's wrapped key against its verification hash
    Verify {
        #[arg(long, short = 'u')]
        user: i64,
    },
}

#[derive(Subcommand, Debug)]
enum PasswordAction {
    /// Hash a login password (Argon2id PHC string)
    Hash,
    /// Wrap an SMB restoration password under the master key (base64)
    Wrap,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file), secrets redacted
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Manifest { action } => match action {
            ManifestAction::Build { share, user } => {
                cmd_manifest_build(&config, share.as_deref(), user).await
            }
            ManifestAction::Show { path, files } => cmd_manifest_show(&path, files),
            ManifestAction::Diff { old, new } => cmd_manifest_diff(&old, &new),
        },
        Commands::Restore {
            peer,
            user,
            share,
            source_server,
            no_chown,
        } => cmd_restore(&config, &peer, user, &share, &source_server, !no_chown).await,
        Commands::Peer { action } => match action {
            PeerAction::List => cmd_peer_list(&config),
            PeerAction::Test { peer } => cmd_peer_test(&config, &peer).await,
        },
        Commands::Key { action } => match action {
            KeyAction::Generate => cmd_key_generate(&config),
            KeyAction::Wrap { key } => cmd_key_wrap(&config, &key),
            KeyAction::Unwrap { user } => cmd_key_unwrap(&config, user),
            KeyAction::Rewrap {
                user,
                new_master_key_file,
            } => cmd_key_rewrap(&config, user, new_master_key_file.as_deref()),
            KeyAction::Verify { user } => cmd_key_verify(&config, user),
        },
        Commands::Encrypt {
            src,
            dst,
            user,
            chunk_size,
        } => cmd_encrypt(&config, &src, &dst, user, chunk_size),
        Commands::Decrypt { src, dst, user } => cmd_decrypt(&config, &src, &dst, user),
        Commands::Password { action } => match action {
            PasswordAction::Hash => cmd_password_hash(),
            PasswordAction::Wrap => cmd_password_wrap(&config),
        },
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Config loading ────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<AnemoneConfig> {
    if path.exists() {
        AnemoneConfig::from_file(path).with_context(|| format!("loading config: {}", path.display()))
    } else {
        Ok(AnemoneConfig::default())
    }
}

/// Master key from the config, falling back to an interactive prompt.
fn master_key(config: &AnemoneConfig) -> Result<SecretString> {
    if let Some(key) = config.crypto.load_master_key()? {
        return Ok(key);
    }
    let entered = rpassword::prompt_password("Master key: ").context("reading master key")?;
    if entered.is_empty() {
        bail!("master key cannot be empty");
    }
    Ok(SecretString::from(entered))
}

fn find_user(config: &AnemoneConfig, user_id: i64) -> Result<&UserRecord> {
    config
        .users
        .iter()
        .find(|u| u.id == user_id)
        .with_context(|| format!("user {user_id} is not in the [[users]] table"))
}

fn find_peer<'a>(config: &'a AnemoneConfig, name_or_id: &str) -> Result<&'a Peer> {
    let by_id = name_or_id.parse::<i64>().ok();
    config
        .peers
        .iter()
        .find(|p| p.name == name_or_id || Some(p.id) == by_id)
        .with_context(|| format!("peer {name_or_id:?} is not in the [[peers]] table"))
}

/// Unwrap a user's data key and check it against the stored verification hash.
fn user_data_key(config: &AnemoneConfig, user_id: i64) -> Result<DataKey> {
    let user = find_user(config, user_id)?;
    let wrapped = user
        .encryption_key_encrypted
        .as_deref()
        .with_context(|| format!("user {user_id} has no wrapped data key"))?;
    let master = master_key(config)?;
    let key = anemone_crypto::unwrap_data_key(wrapped, &master)
        .context("unwrapping data key (wrong master key?)")?;
    if let Some(hash) = user.encryption_key_hash.as_deref() {
        if !anemone_crypto::verify_data_key(&key, hash) {
            bail!("data key for user {user_id} does not match its verification hash");
        }
    }
    Ok(key)
}

/// Accepts either a share directory or the manifest file itself.
fn read_manifest(path: &Path) -> Result<Manifest> {
    let file = if path.is_dir() {
        manifest_path(path)
    } else {
        path.to_path_buf()
    };
    let data = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    Manifest::from_slice(&data).with_context(|| format!("parsing {}", file.display()))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {pos}/{len} files {wide_msg}",
    )
    .map(|s| s.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Mirror restore progress onto a bar until the sender is dropped.
async fn render_progress(mut rx: watch::Receiver<RestoreProgress>, pb: ProgressBar) {
    let mut styled = false;
    while rx.changed().await.is_ok() {
        let p = rx.borrow_and_update().clone();
        if !styled && p.total_files > 0 {
            pb.set_style(bar_style());
            styled = true;
        }
        pb.set_length(p.total_files as u64);
        pb.set_position(p.processed_files as u64);
        pb.set_message(if p.errors.is_empty() {
            p.current_file
        } else {
            format!("{} ({} errors)", p.current_file, p.errors.len())
        });
    }
}

// ── `anemone manifest` ────────────────────────────────────────────────────────

async fn cmd_manifest_build(
    config: &AnemoneConfig,
    share_name: Option<&str>,
    user: Option<i64>,
) -> Result<()> {
    let registry = Arc::new(ConfigRegistry::from_config(config));
    let engine = ManifestEngine::new(EngineOptions::from(&config.manifest));
    let scheduler =
        ManifestScheduler::new(engine, registry.clone(), registry.clone(), &config.manifest);

    let Some(name) = share_name else {
        let pb = make_spinner("manifest");
        pb.set_message(format!("building {} shares...", config.shares.len()));
        let summary = scheduler.generate_all().await?;
        pb.finish_and_clear();
        println!("Manifest sweep complete:");
        println!("  succeeded: {}", summary.succeeded);
        println!("  failed:    {}", summary.failed);
        println!("  files:     {} ({})", summary.files, format_size(summary.bytes));
        if summary.failed > 0 {
            bail!("{} share(s) failed; rerun with --log warn for details", summary.failed);
        }
        return Ok(());
    };

    let mut matches: Vec<_> = registry
        .all_shares()?
        .into_iter()
        .filter(|s| s.name == name && user.is_none_or(|u| s.user_id == u))
        .collect();
    let share = match matches.len() {
        0 => bail!("share {name:?} is not in the [[shares]] table"),
        1 => matches.remove(0),
        _ => bail!("share {name:?} exists for several users; pass --user"),
    };

    let pb = make_spinner("manifest");
    pb.set_message(format!("building {}...", share.path.display()));
    let stats = scheduler
        .generate_for_share(&share)
        .await
        .with_context(|| format!("building manifest for {name}"))?;
    pb.finish_and_clear();

    println!("Manifest written: {}", manifest_path(&share.path).display());
    println!("  files:   {} ({})", stats.files, format_size(stats.total_size));
    println!("  hashed:  {}", stats.hashed);
    println!("  reused:  {}", stats.reused);
    if stats.skipped > 0 {
        println!("  skipped: {} (unreadable)", stats.skipped);
    }
    Ok(())
}

fn cmd_manifest_show(path: &Path, files: bool) -> Result<()> {
    let m = read_manifest(path)?;
    println!("Share:      {} ({})", m.share_name, m.share_type.as_str());
    println!("Owner:      {}", m.username);
    println!("Generated:  {}", m.generated_at.to_rfc3339());
    println!("Version:    {}", m.version);
    println!("Files:      {} ({})", m.file_count, format_size(m.total_size));
    if files {
        println!();
        for f in &m.files {
            println!("{:>10}  {}  {}", format_size(f.size), short_hash(&f.hash), f.path);
        }
    }
    Ok(())
}

fn cmd_manifest_diff(old: &Path, new: &Path) -> Result<()> {
    let older = read_manifest(old)?;
    let newer = read_manifest(new)?;
    let diff = newer.diff(&older);
    if diff.is_empty() {
        println!("No changes ({} files)", newer.file_count);
        return Ok(());
    }
    for p in &diff.added {
        println!("+ {p}");
    }
    for p in &diff.modified {
        println!("~ {p}");
    }
    for p in &diff.removed {
        println!("- {p}");
    }
    println!();
    println!(
        "{} added, {} modified, {} removed",
        diff.added.len(),
        diff.modified.len(),
        diff.removed.len()
    );
    Ok(())
}

/// `sha256:84d89877f0d4...` for display
fn short_hash(hash: &str) -> &str {
    let end = hash.find(':').map(|i| i + 13).unwrap_or(12);
    &hash[..end.min(hash.len())]
}

// ── `anemone restore` ─────────────────────────────────────────────────────────

async fn cmd_restore(
    config: &AnemoneConfig,
    peer_ref: &str,
    user_id: i64,
    share_name: &str,
    source_server: &str,
    chown: bool,
) -> Result<()> {
    let peer = find_peer(config, peer_ref)?;
    if !peer.enabled {
        bail!("peer {} is disabled", peer.name);
    }
    let client = PeerClient::new(peer, &PeerClientConfig::from(&config.restore))
        .with_context(|| format!("building client for peer {}", peer.name))?;
    let master = master_key(config)?;

    let registry = Arc::new(ConfigRegistry::from_config(config));
    let restorer = PeerRestore::new(
        client,
        registry.clone(),
        registry,
        Some(master),
        RestoreOptions {
            chown: chown && config.restore.chown,
        },
    );

    println!(
        "Restoring {share_name} (user {user_id}) from {} [{}]",
        peer.name, source_server
    );

    let (tx, rx) = watch::channel(RestoreProgress::default());
    let pb = make_spinner("restore");
    pb.set_message("fetching manifest...");
    let renderer = tokio::spawn(render_progress(rx, pb.clone()));

    let request = RestoreRequest {
        user_id,
        share_name: share_name.to_string(),
        source_server: source_server.to_string(),
    };
    let result = restorer.restore(&request, Some(&tx)).await;
    drop(tx);
    let _ = renderer.await;

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e).context("restore aborted");
        }
    };
    pb.finish_with_message("done");

    println!();
    println!("Restore complete:");
    println!(
        "  files:  {}/{} ({})",
        summary.processed_files.saturating_sub(summary.errors.len()),
        summary.total_files,
        format_size(summary.bytes_transferred)
    );
    if !summary.is_complete() {
        println!("  failed: {}", summary.errors.len());
        for err in &summary.errors {
            println!("    {err}");
        }
        bail!("{} file(s) could not be restored", summary.errors.len());
    }
    Ok(())
}

// ── `anemone peer` ────────────────────────────────────────────────────────────

fn cmd_peer_list(config: &AnemoneConfig) -> Result<()> {
    if config.peers.is_empty() {
        println!("No peers configured");
        return Ok(());
    }
    for p in &config.peers {
        println!(
            "{:>4}  {:<20} {}:{}  {}{}",
            p.id,
            p.name,
            p.address,
            p.port,
            if p.enabled { "enabled" } else { "disabled" },
            p.last_sync
                .map(|t| format!("  last sync {}", t.to_rfc3339()))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_peer_test(config: &AnemoneConfig, peer_ref: &str) -> Result<()> {
    let peer = find_peer(config, peer_ref)?;
    let client = PeerClient::new(peer, &PeerClientConfig::from(&config.restore))?;
    client
        .health()
        .await
        .with_context(|| format!("peer {} at {} is not healthy", peer.name, client.base_url()))?;
    println!("{}: ok ({})", peer.name, client.base_url());
    Ok(())
}

// ── `anemone key` ─────────────────────────────────────────────────────────────

fn cmd_key_generate(config: &AnemoneConfig) -> Result<()> {
    let master = master_key(config)?;
    let (_key, wrapped) = anemone_crypto::WrappedDataKey::generate(&master)?;
    println!("encryption_key_encrypted = \"{}\"", wrapped.encrypted);
    println!("encryption_key_hash = \"{}\"", wrapped.hash);
    Ok(())
}

fn cmd_key_wrap(config: &AnemoneConfig, key_b64: &str) -> Result<()> {
    let key = DataKey::from_base64(key_b64.trim()).context("parsing data key")?;
    let master = master_key(config)?;
    println!(
        "encryption_key_encrypted = \"{}\"",
        anemone_crypto::wrap_data_key(&key, &master)?
    );
    println!(
        "encryption_key_hash = \"{}\"",
        anemone_crypto::key_verification_hash(&key)
    );
    Ok(())
}

fn cmd_key_unwrap(config: &AnemoneConfig, user_id: i64) -> Result<()> {
    let key = user_data_key(config, user_id)?;
    println!("{}", key.to_base64().as_str());
    Ok(())
}

fn cmd_key_rewrap(config: &AnemoneConfig, user_id: i64, new_key_file: Option<&Path>) -> Result<()> {
    let user = find_user(config, user_id)?;
    let wrapped = user
        .encryption_key_encrypted
        .as_deref()
        .with_context(|| format!("user {user_id} has no wrapped data key"))?;
    let old_master = master_key(config)?;

    let new_master = match new_key_file {
        Some(path) => {
            let crypto = anemone_core::config::CryptoConfig {
                master_key: None,
                master_key_file: Some(path.to_path_buf()),
            };
            crypto
                .load_master_key()?
                .context("new master key file is empty")?
        }
        None => prompt_twice("New master key: ")?,
    };

    let rewrapped = anemone_crypto::rewrap_data_key(wrapped, &old_master, &new_master)
        .context("re-wrapping data key (wrong current master key?)")?;
    println!("encryption_key_encrypted = \"{rewrapped}\"");
    Ok(())
}

fn cmd_key_verify(config: &AnemoneConfig, user_id: i64) -> Result<()> {
    let user = find_user(config, user_id)?;
    if user.encryption_key_hash.is_none() {
        bail!("user {user_id} has no verification hash");
    }
    user_data_key(config, user_id)?;
    println!("user {user_id} ({}): data key ok", user.username);
    Ok(())
}

// ── `anemone encrypt` / `anemone decrypt` ─────────────────────────────────────

fn cmd_encrypt(
    config: &AnemoneConfig,
    src: &Path,
    dst: &Path,
    user_id: i64,
    chunk_size: usize,
) -> Result<()> {
    let key = user_data_key(config, user_id)?;
    anemone_crypto::encrypt_file(src, dst, &key, chunk_size)
        .with_context(|| format!("encrypting {}", src.display()))?;
    println!("{} -> {}", src.display(), dst.display());
    Ok(())
}

fn cmd_decrypt(config: &AnemoneConfig, src: &Path, dst: &Path, user_id: i64) -> Result<()> {
    let key = user_data_key(config, user_id)?;
    anemone_crypto::decrypt_file(src, dst, &key)
        .with_context(|| format!("decrypting {}", src.display()))?;
    println!("{} -> {}", src.display(), dst.display());
    Ok(())
}

// ── `anemone password` ────────────────────────────────────────────────────────

fn prompt_twice(prompt: &str) -> Result<SecretString> {
    let first = rpassword::prompt_password(prompt).context("reading password")?;
    let second = rpassword::prompt_password("Repeat: ").context("reading password")?;
    if first != second {
        bail!("entries do not match");
    }
    if first.is_empty() {
        bail!("password cannot be empty");
    }
    Ok(SecretString::from(first))
}

fn cmd_password_hash() -> Result<()> {
    let password = prompt_twice("Password: ")?;
    println!("{}", anemone_crypto::hash_password(&password)?);
    Ok(())
}

fn cmd_password_wrap(config: &AnemoneConfig) -> Result<()> {
    let password = prompt_twice("SMB password: ")?;
    let master = master_key(config)?;
    let wrapped = anemone_crypto::encrypt_password(password.expose_secret(), &master)?;
    println!("{}", B64.encode(wrapped));
    Ok(())
}

// ── `anemone config show` ─────────────────────────────────────────────────────

const REDACTED: &str = "<redacted>";

fn redacted(config: &AnemoneConfig) -> AnemoneConfig {
    let mut config = config.clone();
    if config.crypto.master_key.is_some() {
        config.crypto.master_key = Some(REDACTED.into());
    }
    for peer in &mut config.peers {
        if peer.password.is_some() {
            peer.password = Some(REDACTED.into());
        }
    }
    config
}

fn cmd_config_show(config: &AnemoneConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered =
        toml::to_string_pretty(&redacted(config)).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
