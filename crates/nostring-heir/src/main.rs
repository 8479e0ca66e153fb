//! NoString Heir: claim an inheritance vault from the command line
//!
//! Drives one in-memory claim workflow. Nothing is persisted between runs,
//! and no private key is ever read: the heir signs the claim PSBT on their
//! own device.
//!
//! # Usage
//!
//! ```bash
//! nostring-heir status backup.json
//! nostring-heir build backup.json --to tb1q... --fee-rate 5 --out claim.psbt
//! nostring-heir broadcast backup.json --to tb1q... --fee-rate 5 --psbt signed.psbt
//! nostring-heir --validate
//! ```

use anyhow::{Context, Result};
use nostring_heir::{
    descriptor, ChainStatusProvider, ClaimRequest, ClaimWorkflow, HeirConfig, NativeVaultCore,
    VaultDescriptor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_CONFIG: &str = "nostring-heir.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Status,
    Build,
    Broadcast,
}

#[derive(Debug)]
struct Args {
    config_path: Option<PathBuf>,
    validate_only: bool,
    command: Option<Command>,
    backup: Option<PathBuf>,
    destination: Option<String>,
    fee_rate: u64,
    heir_index: usize,
    psbt: Option<PathBuf>,
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize rustls CryptoProvider before any TLS connection (Esplora / Electrum over SSL)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let args = match parse_args(std::env::args().skip(1).collect())? {
        Some(args) => args,
        None => return Ok(()),
    };

    // Load config; a missing default file means defaults
    let mut config = match &args.config_path {
        Some(path) => HeirConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            HeirConfig::from_file(Path::new(DEFAULT_CONFIG))?
        }
        None => HeirConfig::default(),
    };

    config.apply_env_overrides();

    let endpoints = config
        .validate()
        .context("Configuration validation failed")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.general.log_level.as_str()),
    )
    .init();

    if args.validate_only {
        println!("✅ Configuration is valid.");
        println!("  Backend:       {}", endpoints.backend());
        for network in [
            bitcoin::Network::Bitcoin,
            bitcoin::Network::Testnet,
            bitcoin::Network::Signet,
            bitcoin::Network::Regtest,
        ] {
            if let Ok(url) = endpoints.endpoint(network) {
                println!("  {:<14} {}", format!("{}:", network), url);
            }
        }
        println!("  Timeout:       {} secs", config.chain.timeout_secs);
        println!("  Attempts:      {}", config.chain.attempts);
        println!("  Max fee rate:  {} sat/vB", config.claim.max_fee_rate);
        return Ok(());
    }

    let command = match args.command {
        Some(c) => c,
        None => {
            print_help();
            return Ok(());
        }
    };
    let backup_path = args
        .backup
        .clone()
        .context("a vault backup file is required")?;
    let payload = std::fs::read_to_string(&backup_path)
        .with_context(|| format!("Failed to read backup {}", backup_path.display()))?;

    // Import once up front to learn which network to connect to
    let vault = descriptor::import(&payload, &NativeVaultCore)
        .with_context(|| format!("Failed to import {}", backup_path.display()))?;
    let url = endpoints.endpoint(vault.network)?.to_string();

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let result = rt.block_on(async {
        tokio::select! {
            result = run(command, &args, &config, &vault, &payload, &url) => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received shutdown signal. Exiting…");
                Ok(())
            }
        }
    });

    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(
    command: Command,
    args: &Args,
    config: &HeirConfig,
    vault: &VaultDescriptor,
    payload: &str,
    url: &str,
) -> Result<()> {
    let settings = config.chain_settings();
    let source = nostring_chain::connect(config.backend()?, url, vault.network, settings.timeout)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    let provider = ChainStatusProvider::new(source, settings);
    let mut workflow =
        ClaimWorkflow::new(Arc::new(NativeVaultCore), provider, config.claim.max_fee_rate);

    workflow.import(payload)?;
    println!("Vault:       {} ({})", vault.vault_address, vault.network);
    println!(
        "Heirs:       {} ({}-of-{})",
        vault.heir_labels.join(", "),
        vault.threshold,
        vault.heir_count
    );

    let eligibility = workflow.check_status().await?.clone();
    println!("Height:      {}", eligibility.current_height);
    println!("Funded at:   {}", eligibility.confirmation_height);
    println!("Unlocks at:  {}", eligibility.unlock_height);
    if eligibility.eligible {
        println!("Status:      ✅ eligible to claim");
    } else {
        println!(
            "Status:      🔒 locked, {} blocks remaining (estimate {})",
            eligibility.blocks_remaining, eligibility.time_estimate
        );
    }

    if command == Command::Status || !eligibility.eligible {
        return Ok(());
    }

    let destination = args
        .destination
        .clone()
        .context("--to <address> is required")?;
    let claim = workflow
        .build_claim(ClaimRequest {
            destination,
            heir_index: args.heir_index,
            fee_rate: args.fee_rate,
        })?
        .clone();
    println!(
        "Claim:       {} inputs, {} sat in, {} sat fee ({} sat/vB), {} sat to {}",
        claim.num_inputs,
        claim.total_input_sat,
        claim.fee_sat,
        claim.fee_rate,
        claim.output_sat,
        claim.destination
    );

    if command == Command::Build {
        match &args.out {
            Some(path) => {
                std::fs::write(path, &claim.psbt_base64)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("PSBT written to {}; sign it, then run `broadcast`.", path.display());
            }
            None => println!("{}", claim.psbt_base64),
        }
        return Ok(());
    }

    let psbt_path = args.psbt.as_ref().context("--psbt <file> is required")?;
    let signed = std::fs::read_to_string(psbt_path)
        .with_context(|| format!("Failed to read {}", psbt_path.display()))?;
    let finalized = workflow.finalize(signed.trim())?.clone();
    println!("Finalized:   {}", finalized.txid);

    let receipt = workflow.broadcast().await?;
    if receipt.already_known {
        println!("✅ {} was already on the network", receipt.txid);
    } else {
        println!("✅ Broadcast {}", receipt.txid);
    }
    Ok(())
}

/// Returns `None` when the invocation only printed help or version.
fn parse_args(args: Vec<String>) -> Result<Option<Args>> {
    let mut parsed = Args {
        config_path: None,
        validate_only: false,
        command: None,
        backup: None,
        destination: None,
        fee_rate: 1,
        heir_index: 0,
        psbt: None,
        out: None,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => parsed.config_path = Some(PathBuf::from(value(&args, &mut i)?)),
            "--validate" => parsed.validate_only = true,
            "--to" => parsed.destination = Some(value(&args, &mut i)?),
            "--fee-rate" => {
                parsed.fee_rate = value(&args, &mut i)?
                    .parse()
                    .context("--fee-rate must be an integer (sat/vB)")?
            }
            "--heir" => {
                parsed.heir_index = value(&args, &mut i)?
                    .parse()
                    .context("--heir must be an index")?
            }
            "--psbt" => parsed.psbt = Some(PathBuf::from(value(&args, &mut i)?)),
            "--out" | "-o" => parsed.out = Some(PathBuf::from(value(&args, &mut i)?)),
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            "--version" | "-V" => {
                println!("nostring-heir {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "status" if parsed.command.is_none() => parsed.command = Some(Command::Status),
            "build" if parsed.command.is_none() => parsed.command = Some(Command::Build),
            "broadcast" if parsed.command.is_none() => parsed.command = Some(Command::Broadcast),
            other if !other.starts_with('-') && parsed.command.is_some() && parsed.backup.is_none() => {
                parsed.backup = Some(PathBuf::from(other))
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    Ok(Some(parsed))
}

fn value(args: &[String], i: &mut usize) -> Result<String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .cloned()
        .with_context(|| format!("{} requires an argument", flag))
}

fn print_help() {
    println!(
        r#"NoString Heir: claim a NoString inheritance vault

USAGE:
    nostring-heir [OPTIONS] <COMMAND> <BACKUP.json>

COMMANDS:
    status       Check whether the vault's timelock has expired
    build        Build an unsigned claim PSBT for your signing device
    broadcast    Finalize a signed claim PSBT and broadcast it

OPTIONS:
    -c, --config <PATH>    Config file path [default: ./nostring-heir.toml]
        --validate         Validate config and exit
        --to <ADDRESS>     Destination address for the claimed funds
        --fee-rate <N>     Fee rate in sat/vB [default: 1]
        --heir <INDEX>     Your heir index in the backup [default: 0]
        --psbt <PATH>      Signed PSBT (broadcast)
    -o, --out <PATH>       Write the unsigned PSBT here (build)
    -h, --help             Print help
    -V, --version          Print version

`broadcast` rebuilds the claim before finalizing, so pass the same --to,
--fee-rate and --heir you used for `build`.

ENVIRONMENT VARIABLES:
    NOSTRING_HEIR_LOG_LEVEL           Override log level
    NOSTRING_HEIR_BACKEND             esplora | electrum
    NOSTRING_HEIR_TIMEOUT_SECS        Per-request timeout
    NOSTRING_HEIR_ATTEMPTS            Chain query attempts
    NOSTRING_HEIR_MAX_FEE_RATE        Fee rate ceiling (sat/vB)
    NOSTRING_HEIR_ENDPOINT_<NETWORK>  Endpoint for BITCOIN, TESTNET, SIGNET or REGTEST
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_build() {
        let parsed = parse_args(args("build vault.json --to tb1qxyz --fee-rate 7 --heir 2 -o claim.psbt"))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.command, Some(Command::Build));
        assert_eq!(parsed.backup, Some(PathBuf::from("vault.json")));
        assert_eq!(parsed.destination.as_deref(), Some("tb1qxyz"));
        assert_eq!(parsed.fee_rate, 7);
        assert_eq!(parsed.heir_index, 2);
        assert_eq!(parsed.out, Some(PathBuf::from("claim.psbt")));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(parse_args(args("status vault.json extra")).is_err());
        assert!(parse_args(args("--frobnicate")).is_err());
        assert!(parse_args(args("build vault.json --fee-rate")).is_err());
        assert!(parse_args(args("build vault.json --fee-rate fast")).is_err());
    }

    #[test]
    fn test_parse_validate() {
        let parsed = parse_args(args("-c /etc/heir.toml --validate")).unwrap().unwrap();
        assert!(parsed.validate_only);
        assert_eq!(parsed.config_path, Some(PathBuf::from("/etc/heir.toml")));
        assert!(parsed.command.is_none());
    }
}
