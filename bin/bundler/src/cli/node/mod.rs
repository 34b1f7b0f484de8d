// This file is part of Bundler.
//
// Bundler is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// Bundler is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with Bundler.
// If not, see https://www.gnu.org/licenses/.

use std::{path::PathBuf, sync::Arc, time::Duration};

use alloy_primitives::{address, Address};
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use bundler_builder::{BuilderEvent, BuilderEventKind, BundleExecutorImpl, Bundler, BundlerTask};
use bundler_pool::{PersistentMempool, PersistentReputation, Store};
use bundler_provider::{new_alloy_provider, AlloyEntryPoint};
use bundler_task::spawn_tasks_with_shutdown;
use bundler_types::{BundlerConfig, MempoolConfig, ReputationConfig};
use bundler_utils::emit::{self, WithEntryPoint, EVENT_CHANNEL_CAPACITY};
use clap::Args;
use serde::Deserialize;
use tokio::sync::broadcast;

use super::json::get_json_config;

const DB_FILE_NAME: &str = "bundler.redb";
const ENTRY_POINT_V0_7: Address = address!("0000000071727De22E5E9d8BAf0edAc6f37da032");

/// CLI options for the bundler node
#[derive(Debug, Args)]
#[command(next_help_heading = "Node")]
pub(super) struct NodeArgs {
    /// Ethereum node HTTP RPC url
    #[arg(long = "node_http", name = "node_http", env = "NODE_HTTP")]
    node_http: String,

    /// Private key of the account that signs and pays for bundles
    #[arg(
        long = "signer.private_key",
        name = "signer.private_key",
        env = "SIGNER_PRIVATE_KEY",
        hide_env_values = true,
        value_parser = parse_signer
    )]
    signer: PrivateKeySigner,

    /// Entry points to bundle for, overrides the config file
    #[arg(
        long = "entry_points",
        name = "entry_points",
        env = "ENTRY_POINTS",
        value_delimiter = ','
    )]
    entry_points: Vec<Address>,

    /// Recipient of bundle fees, defaults to the signer address
    #[arg(long = "beneficiary", name = "beneficiary", env = "BENEFICIARY")]
    beneficiary: Option<Address>,

    /// Chain id, overrides the config file
    #[arg(long = "chain_id", name = "chain_id", env = "CHAIN_ID")]
    chain_id: Option<u64>,

    /// Directory holding the mempool and reputation database
    #[arg(
        long = "data_dir",
        name = "data_dir",
        env = "DATA_DIR",
        default_value = "./data"
    )]
    data_dir: PathBuf,

    /// Path to a JSON config file with `bundler`, `reputation` and `mempool` sections
    #[arg(long = "config", name = "config", env = "CONFIG_PATH")]
    config_path: Option<String>,

    /// Maximum operations per bundle, overrides the config file
    #[arg(long = "max_bundle_size", name = "max_bundle_size", env = "MAX_BUNDLE_SIZE")]
    max_bundle_size: Option<usize>,

    /// Time between bundling cycles in seconds, overrides the config file
    #[arg(
        long = "bundle_interval_secs",
        name = "bundle_interval_secs",
        env = "BUNDLE_INTERVAL_SECS"
    )]
    bundle_interval_secs: Option<u64>,

    /// Time between receipt polls in milliseconds
    #[arg(
        long = "receipt.poll_interval_millis",
        name = "receipt.poll_interval_millis",
        env = "RECEIPT_POLL_INTERVAL_MILLIS",
        default_value = "2000"
    )]
    receipt_poll_interval_millis: u64,

    /// Receipt polls before a submission is treated as reverted
    #[arg(
        long = "receipt.max_polls",
        name = "receipt.max_polls",
        env = "RECEIPT_MAX_POLLS",
        default_value = "90"
    )]
    receipt_max_polls: u32,
}

fn parse_signer(key: &str) -> Result<PrivateKeySigner, String> {
    key.parse()
        .map_err(|e| format!("invalid signer private key: {e}"))
}

/// Contents of the optional JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(super) struct NodeConfig {
    bundler: BundlerConfig,
    reputation: ReputationConfig,
    mempool: MempoolConfig,
}

impl NodeArgs {
    /// Loads the config file, if any, and applies CLI overrides on top.
    fn load_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config: NodeConfig = match &self.config_path {
            Some(path) => get_json_config(path)?,
            None => NodeConfig::default(),
        };

        let bundler = &mut config.bundler;
        if !self.entry_points.is_empty() {
            bundler.supported_entry_points = self.entry_points.clone();
        }
        if bundler.supported_entry_points.is_empty() {
            bundler.supported_entry_points = vec![ENTRY_POINT_V0_7];
        }
        if let Some(beneficiary) = self.beneficiary {
            bundler.beneficiary_address = beneficiary;
        }
        if bundler.beneficiary_address.is_zero() {
            bundler.beneficiary_address = self.signer.address();
        }
        if let Some(chain_id) = self.chain_id {
            bundler.chain_id = chain_id;
        }
        if let Some(max_bundle_size) = self.max_bundle_size {
            bundler.max_bundle_size = max_bundle_size;
        }
        if let Some(secs) = self.bundle_interval_secs {
            bundler.bundle_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

pub(super) async fn run(args: NodeArgs) -> anyhow::Result<()> {
    let config = args.load_config()?;
    tracing::info!("Bundler config: {:?}", config.bundler);

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("should create data dir {}", args.data_dir.display()))?;
    let store = Store::open(args.data_dir.join(DB_FILE_NAME)).context("should open store")?;
    let mempool = Arc::new(PersistentMempool::new(store.clone(), config.mempool));
    let reputation = Arc::new(PersistentReputation::new(store, config.reputation));

    let provider = new_alloy_provider(&args.node_http, args.signer.clone())?;
    let poll_interval = Duration::from_millis(args.receipt_poll_interval_millis);
    let handlers = config
        .bundler
        .supported_entry_points
        .iter()
        .map(|entry_point| {
            AlloyEntryPoint::new(*entry_point, provider.clone())
                .with_receipt_polling(poll_interval, args.receipt_max_polls)
        });
    let executor = Arc::new(BundleExecutorImpl::new(
        handlers,
        config.bundler.beneficiary_address,
    ));

    let (event_sender, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    emit::log_events(event_rx, is_nonspammy_event);

    let bundler = Bundler::new(mempool, reputation, executor, config.bundler, event_sender);
    spawn_tasks_with_shutdown(
        [BundlerTask::new(bundler).boxed()],
        tokio::signal::ctrl_c(),
    )
    .await;

    Ok(())
}

fn is_nonspammy_event(event: &WithEntryPoint<BuilderEvent>) -> bool {
    !matches!(event.event.kind, BuilderEventKind::OpAdmitted { .. })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use alloy_primitives::B256;
    use clap::Parser;

    use super::*;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        node: NodeArgs,
    }

    fn parse(extra: &[&str]) -> NodeArgs {
        let mut args = vec![
            "bundler",
            "--node_http",
            "http://localhost:8545",
            "--signer.private_key",
            KEY,
        ];
        args.extend_from_slice(extra);
        TestCli::try_parse_from(args).unwrap().node
    }

    #[test]
    fn test_defaults_without_config_file() {
        let args = parse(&[]);
        let config = args.load_config().unwrap();
        assert_eq!(config.bundler.supported_entry_points, vec![ENTRY_POINT_V0_7]);
        assert_eq!(config.bundler.beneficiary_address, args.signer.address());
        assert_eq!(config.bundler.max_bundle_size, BundlerConfig::default().max_bundle_size);
        assert_eq!(config.mempool, MempoolConfig::default());
        assert_eq!(config.reputation, ReputationConfig::default());
    }

    #[test]
    fn test_config_file_with_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "bundler": {{
                    "supportedEntryPoints": ["0x0000000000000000000000000000000000000007"],
                    "beneficiaryAddress": "0x0000000000000000000000000000000000000009",
                    "maxBundleSize": 3,
                    "bundleInterval": 5
                }},
                "mempool": {{ "maxRetries": 1 }}
            }}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = parse(&["--config", &path, "--max_bundle_size", "7", "--chain_id", "10"]);
        let config = args.load_config().unwrap();
        assert_eq!(
            config.bundler.supported_entry_points,
            vec![Address::with_last_byte(7)]
        );
        assert_eq!(config.bundler.beneficiary_address, Address::with_last_byte(9));
        assert_eq!(config.bundler.max_bundle_size, 7);
        assert_eq!(config.bundler.chain_id, 10);
        assert_eq!(config.bundler.bundle_interval, Duration::from_secs(5));
        assert_eq!(config.mempool.max_retries, Some(1));
        assert_eq!(
            config.mempool.pending_ttl,
            MempoolConfig::default().pending_ttl
        );
    }

    #[test]
    fn test_entry_point_and_beneficiary_flags() {
        let args = parse(&[
            "--entry_points",
            "0x0000000000000000000000000000000000000001,0x0000000000000000000000000000000000000002",
            "--beneficiary",
            "0x0000000000000000000000000000000000000003",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(
            config.bundler.supported_entry_points,
            vec![Address::with_last_byte(1), Address::with_last_byte(2)]
        );
        assert_eq!(config.bundler.beneficiary_address, Address::with_last_byte(3));
    }

    #[test]
    fn test_missing_config_file() {
        let args = parse(&["--config", "/nonexistent/bundler.json"]);
        assert!(args.load_config().is_err());
    }

    #[test]
    fn test_invalid_signer_key() {
        let err = TestCli::try_parse_from([
            "bundler",
            "--node_http",
            "http://localhost:8545",
            "--signer.private_key",
            "not-a-key",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("invalid signer private key"));
    }

    #[test]
    fn test_admitted_events_are_filtered() {
        let admitted = WithEntryPoint {
            entry_point: ENTRY_POINT_V0_7,
            event: BuilderEvent {
                kind: BuilderEventKind::OpAdmitted {
                    op_hash: B256::ZERO,
                    sender: Address::ZERO,
                },
            },
        };
        assert!(!is_nonspammy_event(&admitted));

        let failed = WithEntryPoint {
            entry_point: ENTRY_POINT_V0_7,
            event: BuilderEvent {
                kind: BuilderEventKind::BundleFailed {
                    tx_hash: None,
                    error: Arc::new("Empty bundle".to_string()),
                    op_hashes: Arc::new(vec![]),
                },
            },
        };
        assert!(is_nonspammy_event(&failed));
    }
}
