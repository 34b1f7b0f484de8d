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

use anyhow::Context;
use clap::{Args, Parser};

mod json;
mod node;
mod prometheus_exporter;
mod tracing;

use node::NodeArgs;

/// Main entry point for the CLI
///
/// Parses the CLI arguments, configures logging and metrics, then runs the
/// bundler node until it is interrupted.
pub async fn run() -> anyhow::Result<()> {
    let opt = Cli::parse();
    let _guard = tracing::configure_logging(&opt.logs)?;
    tracing::info!("Parsed CLI options: {:#?}", opt);

    let metrics_addr = format!("{}:{}", opt.metrics.host, opt.metrics.port).parse()?;
    prometheus_exporter::initialize(metrics_addr, &opt.metrics.tags)
        .context("metrics server should start")?;

    node::run(opt.node).await
}

/// CLI options for the metrics server
#[derive(Debug, Args)]
#[command(next_help_heading = "Metrics")]
struct MetricsArgs {
    /// Port to listen on for metrics requests
    #[arg(
        long = "metrics.port",
        name = "metrics.port",
        env = "METRICS_PORT",
        default_value = "8080",
        global = true
    )]
    port: u16,

    /// Host to listen on for metrics requests
    #[arg(
        long = "metrics.host",
        name = "metrics.host",
        env = "METRICS_HOST",
        default_value = "0.0.0.0",
        global = true
    )]
    host: String,

    /// Tags for metrics in the format key1=value1,key2=value2,...
    #[arg(
        long = "metrics.tags",
        name = "metrics.tags",
        env = "METRICS_TAGS",
        default_values_t = Vec::<String>::new(),
        value_delimiter = ',',
        global = true
    )]
    tags: Vec<String>,
}

/// CLI options for logging
#[derive(Debug, Args)]
#[command(next_help_heading = "Logging")]
struct LogsArgs {
    /// Log file
    ///
    /// If not provided, logs will be written to stdout
    #[arg(
        long = "log.file",
        name = "log.file",
        env = "LOG_FILE",
        default_value = None,
        global = true
    )]
    file: Option<String>,

    /// Filter directives used when `RUST_LOG` is unset
    #[arg(
        long = "log.level",
        name = "log.level",
        env = "LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    level: String,

    /// If set, logs will be written in JSON format
    #[arg(
        long = "log.json",
        name = "log.json",
        env = "LOG_JSON",
        required = false,
        num_args = 0,
        global = true
    )]
    json: bool,
}

/// CLI options
#[derive(Debug, Parser)]
#[command(name = "bundler", version, about = "ERC-4337 bundler node")]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,

    #[command(flatten)]
    metrics: MetricsArgs,

    #[command(flatten)]
    logs: LogsArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn test_metrics_and_log_defaults() {
        let cli = Cli::try_parse_from([
            "bundler",
            "--node_http",
            "http://localhost:8545",
            "--signer.private_key",
            KEY,
        ])
        .unwrap();
        assert_eq!(cli.metrics.port, 8080);
        assert_eq!(cli.metrics.host, "0.0.0.0");
        assert!(cli.metrics.tags.is_empty());
        assert!(cli.logs.file.is_none());
        assert_eq!(cli.logs.level, "info");
        assert!(!cli.logs.json);
    }

    #[test]
    fn test_metrics_tags() {
        let cli = Cli::try_parse_from([
            "bundler",
            "--node_http",
            "http://localhost:8545",
            "--signer.private_key",
            KEY,
            "--metrics.tags",
            "env=dev,region=eu",
            "--log.json",
        ])
        .unwrap();
        assert_eq!(cli.metrics.tags, vec!["env=dev", "region=eu"]);
        assert!(cli.logs.json);
    }

    #[test]
    fn test_signer_key_required() {
        assert!(Cli::try_parse_from(["bundler", "--node_http", "http://localhost:8545"]).is_err());
    }
}
