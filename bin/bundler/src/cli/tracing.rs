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

use std::{io, path::Path};

pub use tracing::*;
use tracing::subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_log::LogTracer;
use tracing_subscriber::{filter::filter_fn, layer::SubscriberExt, EnvFilter, FmtSubscriber};

use super::LogsArgs;

/// Dependencies whose events are never recorded
const NOISY_TARGETS: &[&str] = &["h2", "hyper", "reqwest", "alloy_transport_http"];

/// Installs the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `--log.level`. The returned guard must be
/// held until shutdown so buffered lines are flushed.
pub fn configure_logging(config: &LogsArgs) -> anyhow::Result<WorkerGuard> {
    let (writer, guard) = writer(config.file.as_deref());
    let builder = FmtSubscriber::builder()
        .with_env_filter(env_filter(&config.level)?)
        .with_writer(writer);
    let quiet = filter_fn(|metadata| !is_noisy_target(metadata.target()));

    if config.json {
        subscriber::set_global_default(builder.json().finish().with(quiet))?;
    } else {
        subscriber::set_global_default(builder.pretty().finish().with(quiet))?;
    }

    // `log` records from dependencies go through the same subscriber
    LogTracer::init()?;

    Ok(guard)
}

fn writer(file: Option<&str>) -> (NonBlocking, WorkerGuard) {
    let Some(file) = file else {
        return tracing_appender::non_blocking(io::stdout());
    };
    let path = Path::new(file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = path.file_name().unwrap_or(path.as_os_str());
    tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name))
}

fn env_filter(default_level: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(default_level)?),
    }
}

fn is_noisy_target(target: &str) -> bool {
    NOISY_TARGETS.iter().any(|noisy| target.starts_with(noisy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noisy_targets() {
        assert!(is_noisy_target("hyper::proto::h1"));
        assert!(is_noisy_target("alloy_transport_http::reqwest_transport"));
        assert!(!is_noisy_target("bundler_builder::bundler"));
        assert!(!is_noisy_target("bundler"));
    }

    #[test]
    fn test_default_level_directives() {
        if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
            return;
        }
        assert!(env_filter("info,bundler_builder=debug").is_ok());
        assert!(env_filter("info=notalevel").is_err());
    }
}
