//! nova-control: operator utilities for the lens gate.
//!
//! - audit-verify / audit-query over exported JSONL audit chains
//! - sanitize-check for prompt-injection triage
//! - turn: run one offline lens turn against stub collaborators
//! - encrypt / decrypt: at-rest envelope round trips

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Parser, Subcommand};
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use nova_audit_spec::{recompute_entry_hash, AuditEntry};
use nova_crypto::{derive_key, EncryptedEnvelope, EncryptionService, KEY_LEN};
use nova_redaction::{PromptSanitizer, SanitizerConfig};

#[derive(Debug, Error)]
enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] nova_crypto::CryptoError),
    #[error("audit chain invalid: {0}")]
    ChainInvalid(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Parser)]
#[command(name = "nova-control", version, about = "NovaOS lens gate control-plane utilities")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify the hash chain of an exported audit JSONL file.
    ///
    /// Entries are checked in file order: previous_hash linkage plus a
    /// recomputed entry hash per line. Exits non-zero on the first break.
    AuditVerify {
        /// Path to the JSONL export (one AuditEntry per line)
        #[arg(long)]
        file: PathBuf,
    },

    /// Filter an exported audit JSONL file and print matching entries.
    AuditQuery {
        #[arg(long)]
        file: PathBuf,

        /// Only entries for this user id
        #[arg(long)]
        user_id: Option<String>,

        /// Only entries in this category (e.g. "security")
        #[arg(long)]
        category: Option<String>,

        /// Only failures
        #[arg(long, default_value_t = false)]
        failed_only: bool,

        /// Case-insensitive substring over description and error message
        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Run the prompt sanitizer over a file (or stdin with "-").
    SanitizeCheck {
        /// Input path, or "-" for stdin
        #[arg(long, default_value = "-")]
        input: String,
    },

    /// Run one offline lens turn against stub providers and a stub model.
    ///
    /// Useful as a smoke test of the full pipeline without network access.
    Turn {
        /// The user message
        #[arg(long)]
        message: String,

        /// Tier for the synthetic principal
        #[arg(long, default_value = "pro")]
        tier: String,
    },

    /// Seal plaintext (stdin or --input) into an encrypted envelope.
    Encrypt {
        #[arg(long, default_value = "-")]
        input: String,

        /// Passphrase; falls back to the ENCRYPTION_KEY env var (base64, 32 bytes)
        #[arg(long)]
        passphrase: Option<String>,
    },

    /// Open an encrypted envelope back to plaintext.
    Decrypt {
        #[arg(long, default_value = "-")]
        input: String,

        #[arg(long)]
        passphrase: Option<String>,
    },
}

fn main() {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), CliError> {
    match args.cmd {
        Command::AuditVerify { file } => audit_verify(&file),
        Command::AuditQuery { file, user_id, category, failed_only, search, limit } => {
            audit_query(&file, user_id, category, failed_only, search, limit)
        }
        Command::SanitizeCheck { input } => sanitize_check(&input),
        Command::Turn { message, tier } => offline_turn(&message, &tier),
        Command::Encrypt { input, passphrase } => encrypt(&input, passphrase),
        Command::Decrypt { input, passphrase } => decrypt(&input, passphrase),
    }
}

// ----------------------------
// Audit
// ----------------------------

fn read_entries(file: &PathBuf) -> Result<Vec<AuditEntry>, CliError> {
    let content = fs::read_to_string(file)?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str::<AuditEntry>(line)?);
    }
    Ok(entries)
}

fn audit_verify(file: &PathBuf) -> Result<(), CliError> {
    let entries = read_entries(file)?;
    let mut prior_hash: Option<String> = None;

    for (idx, entry) in entries.iter().enumerate() {
        if idx > 0 && entry.previous_hash != prior_hash {
            return Err(CliError::ChainInvalid(format!(
                "previous hash link broken at line {} (id {})",
                idx + 1,
                entry.id
            )));
        }
        let recomputed = recompute_entry_hash(entry);
        if recomputed != entry.entry_hash {
            return Err(CliError::ChainInvalid(format!(
                "entry hash verification failed at line {} (id {})",
                idx + 1,
                entry.id
            )));
        }
        prior_hash = Some(entry.entry_hash.clone());
    }

    println!(
        "{}",
        serde_json::json!({ "valid": true, "entriesChecked": entries.len() })
    );
    Ok(())
}

fn audit_query(
    file: &PathBuf,
    user_id: Option<String>,
    category: Option<String>,
    failed_only: bool,
    search: Option<String>,
    limit: usize,
) -> Result<(), CliError> {
    let entries = read_entries(file)?;
    let needle = search.map(|s| s.to_lowercase());
    let mut shown = 0usize;

    for entry in entries {
        if let Some(user) = &user_id {
            if entry.user_id.as_deref() != Some(user.as_str()) {
                continue;
            }
        }
        if let Some(cat) = &category {
            if entry.category.as_str() != cat {
                continue;
            }
        }
        if failed_only && entry.success {
            continue;
        }
        if let Some(n) = &needle {
            let hit = entry.description.to_lowercase().contains(n)
                || entry
                    .error_message
                    .as_deref()
                    .map(|e| e.to_lowercase().contains(n))
                    .unwrap_or(false);
            if !hit {
                continue;
            }
        }
        println!("{}", serde_json::to_string(&entry)?);
        shown += 1;
        if limit > 0 && shown >= limit {
            break;
        }
    }
    Ok(())
}

// ----------------------------
// Sanitizer
// ----------------------------

fn read_input(input: &str) -> Result<String, CliError> {
    if input == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn sanitize_check(input: &str) -> Result<(), CliError> {
    let text = read_input(input)?;
    let sanitizer = PromptSanitizer::new(SanitizerConfig::default());
    let result = sanitizer.sanitize(&text);
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.should_block {
        std::process::exit(2);
    }
    Ok(())
}

// ----------------------------
// Offline turn
// ----------------------------

mod offline {
    use super::*;
    use async_trait::async_trait;
    use nova_audit_log::AuditStore;
    use nova_auth::{Authorizer, OwnershipRegistry, Principal};
    use nova_entities::{EntityValidator, ValidatorConfig};
    use nova_gate::{GateConfig, LensGate, TurnRequest};
    use nova_lens::LensClassifier;
    use nova_llm::{ChatMessage, LlmAdapter, LlmClientConfig, LlmReply, LlmSecurityClient};
    use nova_providers::{
        DataCategory, FetchCore, FetchCoreConfig, FetchQuery, LiveDataProvider, ProviderData,
        ProviderFailure, ProviderRegistry, ReliabilityTier, StockData,
    };
    use nova_ratelimit::{LayeredLimiter, RateLimitConfig, Tier};
    use nova_store::MemoryStore;

    struct StubMarket;

    #[async_trait]
    impl LiveDataProvider for StubMarket {
        fn name(&self) -> &str {
            "stub-market"
        }
        fn categories(&self) -> &[DataCategory] {
            &[DataCategory::Market]
        }
        fn reliability_tier(&self) -> ReliabilityTier {
            ReliabilityTier::Community
        }
        async fn fetch(&self, query: &FetchQuery) -> Result<ProviderData, ProviderFailure> {
            Ok(ProviderData::Market(StockData {
                symbol: query.query.clone(),
                current: 100.00,
                change: 0.50,
                percent_change: 0.50,
                high: 101.00,
                low: 99.00,
                open: 99.50,
                previous_close: 99.50,
                currency: "USD".into(),
            }))
        }
    }

    /// Stub model: repeats the evidence qualitatively, never inventing numbers.
    struct StubModel;

    #[async_trait]
    impl LlmAdapter for StubModel {
        fn name(&self) -> &str {
            "stub-model"
        }
        async fn dispatch(&self, messages: &[ChatMessage], _max: u64) -> Result<LlmReply, String> {
            let has_evidence = messages
                .iter()
                .any(|m| m.is_system() && m.content.contains("Verified evidence"));
            let content = if has_evidence {
                "Based on the verified feed, the quote is available and moving modestly.".to_string()
            } else {
                "Nothing live to report; happy to chat.".to_string()
            };
            Ok(LlmReply { content, finish_reason: Some("stop".into()), usage: Default::default(), provider_request_id: None })
        }
    }

    pub async fn run(message: &str, tier: &str) -> Result<(), CliError> {
        let store = Arc::new(MemoryStore::default());
        let clock: Arc<dyn nova_common::Clock> = Arc::new(nova_common::SystemClock);
        let limiter = Arc::new(LayeredLimiter::new(
            RateLimitConfig::new(100, 60_000),
            RateLimitConfig::new(100, 60_000),
            clock,
        ));
        let fetch_core = Arc::new(FetchCore::new(store.clone(), limiter, FetchCoreConfig::default()));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StubMarket));
        let registry = Arc::new(registry);
        let validator = Arc::new(EntityValidator::new(
            fetch_core.clone(),
            registry.clone(),
            ValidatorConfig::default(),
        ));
        let audit = AuditStore::new(store.clone());
        let authorizer = Arc::new(Authorizer::new(audit.clone(), OwnershipRegistry::new()));
        let llm = Arc::new(LlmSecurityClient::new(
            Arc::new(StubModel),
            PromptSanitizer::default(),
            LlmClientConfig::default(),
        ));
        let gate = LensGate::new(
            registry,
            fetch_core,
            validator,
            Arc::new(LensClassifier::new()),
            llm,
            audit,
            authorizer,
            GateConfig::default(),
        );

        let tier = match tier {
            "enterprise" => Tier::Enterprise,
            "free" => Tier::Free,
            _ => Tier::Pro,
        };
        let outcome = gate
            .handle_turn(TurnRequest {
                principal: Principal::user("offline-operator", tier),
                conversation_id: "offline".into(),
                message: message.to_string(),
            })
            .await;

        println!(
            "{}",
            serde_json::json!({
                "reply": outcome.reply,
                "outcome": outcome.outcome,
                "truthMode": outcome.trace.truth_mode,
                "numericTokenCount": outcome.trace.numeric_token_count,
                "providersCalled": outcome.trace.providers_called,
            })
        );
        Ok(())
    }
}

fn offline_turn(message: &str, tier: &str) -> Result<(), CliError> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(offline::run(message, tier))
}

// ----------------------------
// Crypto
// ----------------------------

fn key_from(passphrase: Option<String>) -> Result<[u8; KEY_LEN], CliError> {
    if let Some(phrase) = passphrase {
        return Ok(derive_key(&phrase, b"nova-control"));
    }
    let raw = std::env::var("ENCRYPTION_KEY")
        .map_err(|_| CliError::Invalid("provide --passphrase or set ENCRYPTION_KEY".into()))?;
    let bytes = BASE64
        .decode(raw.trim())
        .map_err(|e| CliError::Invalid(format!("ENCRYPTION_KEY is not valid base64: {e}")))?;
    let key: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|_| CliError::Invalid("ENCRYPTION_KEY must decode to 32 bytes".into()))?;
    Ok(key)
}

fn encrypt(input: &str, passphrase: Option<String>) -> Result<(), CliError> {
    let plaintext = read_input(input)?;
    let service = EncryptionService::new("cli", key_from(passphrase)?, 1);
    let envelope = service.encrypt(plaintext.as_bytes(), None)?;
    println!("{}", serde_json::to_string(&envelope)?);
    Ok(())
}

fn decrypt(input: &str, passphrase: Option<String>) -> Result<(), CliError> {
    let blob = read_input(input)?;
    let envelope: EncryptedEnvelope = serde_json::from_str(blob.trim())?;
    // Key ring of one: whatever kid the envelope names gets the derived key.
    let service = EncryptionService::new(envelope.kid.clone(), key_from(passphrase)?, envelope.kv);
    let opened = service.decrypt(&envelope, None)?;
    print!("{}", String::from_utf8_lossy(&opened));
    Ok(())
}
