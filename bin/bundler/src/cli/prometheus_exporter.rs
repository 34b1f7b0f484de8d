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

use std::net::SocketAddr;

use anyhow::bail;
use itertools::Itertools;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_util::layers::{PrefixLayer, Stack};

const METRICS_PREFIX: &str = "bundler";

/// Installs the global recorder and serves it over HTTP on `listen_addr`.
///
/// Every series carries the `key=value` labels in `tags` and is prefixed
/// with `bundler_`.
pub fn initialize<'a>(
    listen_addr: SocketAddr,
    tags: impl IntoIterator<Item = &'a String>,
) -> anyhow::Result<()> {
    let builder = parse_tags(tags)?
        .into_iter()
        .fold(
            PrometheusBuilder::new().with_http_listener(listen_addr),
            |builder, (k, v)| builder.add_global_label(k, v),
        );

    let (recorder, exporter) = builder.build()?;
    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!("metrics exporter stopped: {e:?}");
        }
    });
    Stack::new(recorder)
        .push(PrefixLayer::new(METRICS_PREFIX))
        .install()?;

    Ok(())
}

fn parse_tags<'a>(
    tags: impl IntoIterator<Item = &'a String>,
) -> anyhow::Result<Vec<(&'a str, &'a str)>> {
    tags.into_iter()
        .map(|tag| match tag.split('=').collect_tuple() {
            Some((k, v)) if !k.is_empty() => Ok((k, v)),
            _ => bail!("invalid metrics tag {tag:?}, expected key=value"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        let tags = vec!["env=dev".to_string(), "region=".to_string()];
        assert_eq!(
            parse_tags(&tags).unwrap(),
            vec![("env", "dev"), ("region", "")]
        );
    }

    #[test]
    fn test_parse_tags_rejects_malformed() {
        for bad in ["env", "=dev", "a=b=c"] {
            let tags = vec![bad.to_string()];
            assert!(parse_tags(&tags).is_err(), "{bad} should be rejected");
        }
    }
}
