use std::fs;
use std::io::BufRead;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use revenant_api::{default_domain, RegisterRequest};
use revenant_client::{
    collect_files, seal_next, ApiClient, ChainPosition, DirBlobStore, GatewayBlobStore,
    LocalIdentityState, Restorer, Timeouts,
};
use revenant_core::auth::sign_heartbeat;
use revenant_core::backup::manifest_hash_of;
use revenant_core::canonical::sha256;
use revenant_core::eth::sign_typed;
use revenant_core::storage::BlobTags;
use revenant_core::{
    derive_keys, generate_mnemonic, AgentId, AttestationPayload, BackupBlob, BlobStore, Bytes32,
    Eip712Domain, GenesisDeclaration, IdentityKeys, InMemoryBlobStore, RegistrationPayload,
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const PHRASE_ENV: &str = "RV_PHRASE";

#[derive(Debug, Parser)]
#[command(name = "rv")]
#[command(about = "Revenant agent identity, backup and restore CLI")]
struct Cli {
    /// Local identity state (public keys, chain position, recall cache).
    #[arg(long, env = "RV_STATE", default_value = "./revenant-identity.json")]
    state: PathBuf,
    /// Base URL of the revenant service.
    #[arg(long, env = "RV_API")]
    api: Option<String>,
    #[command(flatten)]
    storage: StorageArgs,
    #[arg(long, default_value_t = 5)]
    connect_timeout_secs: u64,
    #[arg(long, default_value_t = 30)]
    read_timeout_secs: u64,
    /// Domain values must match the service's anchor configuration.
    #[arg(long)]
    chain_id: Option<u64>,
    #[arg(long)]
    verifying_contract: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct StorageArgs {
    /// Local blob mirror directory.
    #[arg(long, env = "RV_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,
    #[arg(long, env = "RV_UPLOAD_URL", requires = "gateway_url")]
    upload_url: Option<String>,
    #[arg(long, env = "RV_GATEWAY_URL", requires = "upload_url")]
    gateway_url: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
    Register(RegisterArgs),
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    Restore(RestoreArgs),
    Heartbeat,
    Attest(AttestArgs),
    Trust {
        #[command(subcommand)]
        command: TrustCommand,
    },
}

#[derive(Debug, Subcommand)]
enum IdentityCommand {
    /// Generate a fresh recovery phrase. It is printed once and never stored.
    New,
    Show,
    /// Derive the public identity from a phrase read from `RV_PHRASE` or stdin.
    Derive(DeriveArgs),
}

#[derive(Debug, Args)]
struct DeriveArgs {
    #[arg(long, default_value_t = false)]
    save: bool,
}

#[derive(Debug, Args)]
struct RegisterArgs {
    #[arg(long)]
    dir: PathBuf,
    #[arg(long)]
    name: String,
    #[arg(long)]
    purpose: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value_t = 1)]
    manifest_version: u64,
    #[arg(long, default_value_t = 3600)]
    deadline_secs: u64,
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    Create(BackupCreateArgs),
    List,
}

#[derive(Debug, Args)]
struct BackupCreateArgs {
    #[arg(long)]
    dir: PathBuf,
    #[arg(long, default_value_t = 1)]
    manifest_version: u64,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    /// Restore a single file from the newest backup.
    #[arg(long)]
    file: Option<String>,
    /// Write restored files here; without it only the file list is printed.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct AttestArgs {
    #[arg(long)]
    about: String,
    #[arg(long)]
    note: String,
    #[arg(long, default_value_t = 3600)]
    deadline_secs: u64,
}

#[derive(Debug, Subcommand)]
enum TrustCommand {
    Show(TrustShowArgs),
}

#[derive(Debug, Args)]
struct TrustShowArgs {
    /// Defaults to the agent in the local state file.
    #[arg(long)]
    agent: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Identity { command } => run_identity(&cli, command),
        Command::Register(args) => run_register(&cli, args),
        Command::Backup { command } => match command {
            BackupCommand::Create(args) => run_backup_create(&cli, args),
            BackupCommand::List => run_backup_list(&cli),
        },
        Command::Restore(args) => run_restore(&cli, args),
        Command::Heartbeat => run_heartbeat(&cli),
        Command::Attest(args) => run_attest(&cli, args),
        Command::Trust { command: TrustCommand::Show(args) } => run_trust_show(&cli, args),
    }
}

impl Cli {
    fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            read: Duration::from_secs(self.read_timeout_secs),
        }
    }

    fn api_client(&self) -> Option<ApiClient> {
        self.api.as_deref().map(|url| ApiClient::new(url, self.timeouts()))
    }

    fn require_api(&self) -> Result<ApiClient> {
        self.api_client().ok_or_else(|| anyhow!("this command needs --api or RV_API"))
    }

    fn blob_store(&self) -> Result<Option<Arc<dyn BlobStore>>> {
        if let Some(dir) = &self.storage.storage_dir {
            return Ok(Some(Arc::new(DirBlobStore::open(dir)?)));
        }
        Ok(match (&self.storage.upload_url, &self.storage.gateway_url) {
            (Some(upload), Some(gateway)) => {
                Some(Arc::new(GatewayBlobStore::new(upload, gateway, self.timeouts())))
            }
            _ => None,
        })
    }

    fn domain(&self) -> Result<Eip712Domain> {
        let mut domain = default_domain();
        if let Some(chain_id) = self.chain_id {
            domain.chain_id = chain_id;
        }
        if let Some(contract) = &self.verifying_contract {
            domain.verifying_contract = AgentId::parse(contract)?;
        }
        Ok(domain)
    }

    fn load_state(&self, keys: &IdentityKeys) -> Result<LocalIdentityState> {
        Ok(LocalIdentityState::load(&self.state)?
            .filter(|state| state.identity.agent_id == keys.agent_id())
            .unwrap_or_else(|| LocalIdentityState::new(keys)))
    }
}

/// The phrase comes from the environment or the first line of stdin, never from argv.
fn read_phrase() -> Result<Zeroizing<String>> {
    if let Ok(phrase) = std::env::var(PHRASE_ENV) {
        return Ok(Zeroizing::new(phrase));
    }
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read recovery phrase from stdin")?;
    if line.trim().is_empty() {
        return Err(anyhow!("no recovery phrase: set {PHRASE_ENV} or pipe it on stdin"));
    }
    Ok(line)
}

fn phrase_keys() -> Result<IdentityKeys> {
    let phrase = read_phrase()?;
    Ok(derive_keys(&phrase)?)
}

fn deadline_after(now: OffsetDateTime, secs: u64) -> Result<u64> {
    let now = u64::try_from(now.unix_timestamp()).context("clock before 1970")?;
    Ok(now.saturating_add(secs))
}

fn run_identity(cli: &Cli, command: &IdentityCommand) -> Result<()> {
    match command {
        IdentityCommand::New => {
            let phrase = generate_mnemonic()?;
            let keys = derive_keys(&phrase)?;
            LocalIdentityState::new(&keys).save(&cli.state)?;
            info!(agent_id = %keys.agent_id(), "identity created");
            emit_json(json!({
                "mnemonic": phrase.as_str(),
                "identity": keys.public_identity(),
                "warning": "write the phrase down now; it is not stored anywhere",
            }))
        }
        IdentityCommand::Show => {
            let state = LocalIdentityState::load(&cli.state)?
                .ok_or_else(|| anyhow!("no identity state at {}", cli.state.display()))?;
            emit_json(json!({
                "identity": state.identity,
                "last_backup_seq": state.last_backup_seq,
                "last_header_hash": state.last_header_hash,
                "restored_at": state.restored_at.map(|at| at.unix_timestamp()),
                "recall_cache_expires_at": state
                    .recall_cache
                    .as_ref()
                    .map(|cache| cache.expires_at.unix_timestamp()),
            }))
        }
        IdentityCommand::Derive(args) => {
            let keys = phrase_keys()?;
            if args.save {
                cli.load_state(&keys)?.save(&cli.state)?;
            }
            emit_json(json!({ "identity": keys.public_identity(), "saved": args.save }))
        }
    }
}

fn run_register(cli: &Cli, args: &RegisterArgs) -> Result<()> {
    let api = cli.require_api()?;
    let keys = phrase_keys()?;
    let now = OffsetDateTime::now_utc();
    let files = collect_files(&args.dir)?;
    let identity = keys.public_identity();
    let registration = sign_typed(
        keys.agent.signing_key(),
        &cli.domain()?,
        &RegistrationPayload {
            agent_id: identity.agent_id,
            manifest_hash: manifest_hash_of(&files)?,
            manifest_version: args.manifest_version,
            recovery_pub_key: identity.recovery_pub_key,
            deadline: deadline_after(now, args.deadline_secs)?,
        },
    )?;
    let result = api.register(&RegisterRequest {
        registration,
        recall_pub_key: identity.recall_pub_key,
        genesis: Some(GenesisDeclaration {
            name: args.name.clone(),
            purpose: args.purpose.clone(),
            model: args.model.clone(),
            created_at: now,
        }),
    })?;
    cli.load_state(&keys)?.save(&cli.state)?;
    emit_json(serde_json::to_value(result)?)
}

/// Chain tip from the service when configured, otherwise from the newest blob in storage.
fn chain_tip(
    cli: &Cli,
    keys: &IdentityKeys,
    store: Option<&dyn BlobStore>,
) -> Result<Option<ChainPosition>> {
    if let Some(api) = cli.api_client() {
        let session = api.login(&keys.agent, OffsetDateTime::now_utc())?;
        return Ok(ChainPosition::latest(&api.list_backups(&session)?));
    }
    let store = store.ok_or_else(|| anyhow!("configure --api or a storage backend"))?;
    let newest = store
        .query(keys.agent_id())?
        .into_iter()
        .max_by_key(|record| record.tags.backup_seq);
    let Some(record) = newest else {
        return Ok(None);
    };
    let blob = BackupBlob::decode(&store.get(&record.tx_id)?)?;
    blob.verify(keys.agent_id())?;
    Ok(Some(ChainPosition {
        backup_seq: blob.header.backup_seq,
        header_hash: blob.header.header_hash()?,
    }))
}

fn run_backup_create(cli: &Cli, args: &BackupCreateArgs) -> Result<()> {
    let keys = phrase_keys()?;
    let store = cli.blob_store()?;
    let files = collect_files(&args.dir)?;
    let previous = chain_tip(cli, &keys, store.as_deref())?;
    debug!(previous = ?previous, files = files.len(), "sealing backup");

    let blob =
        seal_next(&keys, &files, previous, args.manifest_version, OffsetDateTime::now_utc())?;
    let bytes = blob.encode()?;
    let header_hash = blob.header.header_hash()?;
    let tx_id = match (cli.api_client(), store.as_deref()) {
        (Some(api), _) => {
            let session = api.login(&keys.agent, OffsetDateTime::now_utc())?;
            api.upload_backup(&session, &bytes)?.tx_id
        }
        (None, Some(store)) => {
            let size = u64::try_from(bytes.len()).context("backup too large")?;
            Some(store.put(&bytes, &BlobTags::for_backup(&blob.header, size))?)
        }
        (None, None) => return Err(anyhow!("configure --api or a storage backend")),
    };

    let mut state = cli.load_state(&keys)?;
    state.record_backup(blob.header.backup_seq, header_hash);
    state.save(&cli.state)?;
    emit_json(json!({
        "backup_id": blob.header.backup_id,
        "backup_seq": blob.header.backup_seq,
        "header_hash": header_hash,
        "manifest_hash": blob.header.manifest_hash,
        "files": files.len(),
        "size_bytes": bytes.len(),
        "tx_id": tx_id,
    }))
}

fn run_backup_list(cli: &Cli) -> Result<()> {
    if let Some(api) = cli.api_client() {
        let keys = phrase_keys()?;
        let session = api.login(&keys.agent, OffsetDateTime::now_utc())?;
        let records = api.list_backups(&session)?;
        return emit_json(json!({ "source": "api", "backups": records }));
    }
    let store = cli.blob_store()?.ok_or_else(|| anyhow!("configure --api or a storage backend"))?;
    let state = LocalIdentityState::load(&cli.state)?
        .ok_or_else(|| anyhow!("no identity state at {}", cli.state.display()))?;
    let backups = store
        .query(state.identity.agent_id)?
        .into_iter()
        .map(|record| {
            json!({
                "tx_id": record.tx_id,
                "backup_seq": record.tags.backup_seq,
                "backup_timestamp": record.tags.backup_timestamp,
                "manifest_hash": record.tags.manifest_hash,
                "size_bytes": record.tags.size_bytes,
            })
        })
        .collect::<Vec<_>>();
    emit_json(json!({ "source": "storage", "backups": backups }))
}

/// Rejects names that would land outside the output directory.
fn output_path(out: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    if relative.components().any(|part| !matches!(part, Component::Normal(_))) {
        return Err(anyhow!("refusing to write unsafe path {name}"));
    }
    Ok(out.join(relative))
}

fn run_restore(cli: &Cli, args: &RestoreArgs) -> Result<()> {
    let phrase = read_phrase()?;
    let api = cli.api_client();
    let store: Arc<dyn BlobStore> = match cli.blob_store()? {
        Some(store) => store,
        None => Arc::new(InMemoryBlobStore::new()),
    };
    let result = Restorer::new(api.as_ref(), store.as_ref(), &cli.state).restore(
        &phrase,
        args.file.as_deref(),
        OffsetDateTime::now_utc(),
    )?;

    if let Some(out) = &args.out {
        for (name, content) in &result.files {
            let path = output_path(out, name)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(&path, content)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
    }
    let mut value = serde_json::to_value(&result)?;
    if let Value::Object(object) = &mut value {
        let written_to = args.out.as_ref().map(|out| out.display().to_string());
        object.insert("written_to".to_string(), json!(written_to));
    }
    emit_json(value)
}

fn run_heartbeat(cli: &Cli) -> Result<()> {
    let api = cli.require_api()?;
    let keys = phrase_keys()?;
    let agent = api.heartbeat(&sign_heartbeat(&keys.agent, OffsetDateTime::now_utc())?)?;
    emit_json(serde_json::to_value(agent)?)
}

fn run_attest(cli: &Cli, args: &AttestArgs) -> Result<()> {
    let api = cli.require_api()?;
    let keys = phrase_keys()?;
    let now = OffsetDateTime::now_utc();
    let signed = sign_typed(
        keys.agent.signing_key(),
        &cli.domain()?,
        &AttestationPayload {
            from: keys.agent_id(),
            about: AgentId::parse(&args.about)?,
            note_hash: Bytes32(sha256(args.note.as_bytes())),
            deadline: deadline_after(now, args.deadline_secs)?,
        },
    )?;
    let session = api.login(&keys.agent, now)?;
    let result = api.attest(&session, &signed)?;
    emit_json(serde_json::to_value(result)?)
}

fn run_trust_show(cli: &Cli, args: &TrustShowArgs) -> Result<()> {
    let api = cli.require_api()?;
    let agent_id = match &args.agent {
        Some(agent) => AgentId::parse(agent)?,
        None => {
            LocalIdentityState::load(&cli.state)?
                .ok_or_else(|| anyhow!("pass --agent or create an identity state first"))?
                .identity
                .agent_id
        }
    };
    emit_json(serde_json::to_value(api.trust(agent_id)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_paths_stay_inside_the_target() {
        let out = Path::new("/tmp/restore");
        assert!(output_path(out, "notes/today.md").is_ok());
        assert!(output_path(out, "../escape.md").is_err());
        assert!(output_path(out, "/etc/passwd").is_err());
    }

    #[test]
    fn non_object_payloads_are_wrapped() {
        let wrapped = with_contract_version(json!([1, 2]));
        assert_eq!(wrapped["contract_version"], CLI_CONTRACT_VERSION);
        assert_eq!(wrapped["payload"], json!([1, 2]));
    }
}
