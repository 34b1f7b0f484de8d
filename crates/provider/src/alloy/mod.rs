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

use alloy_network::EthereumWallet;
use alloy_provider::{Provider as AlloyProvider, ProviderBuilder};
use alloy_rpc_client::ClientBuilder;
use alloy_signer_local::PrivateKeySigner;
use alloy_transport::layers::RetryBackoffLayer;
use anyhow::Context;
use url::Url;

mod entry_point;
pub use entry_point::AlloyEntryPoint;

/// Creates a signing alloy provider for `rpc_url`.
///
/// Rate limited requests are retried with backoff before surfacing as errors.
pub fn new_alloy_provider(
    rpc_url: &str,
    signer: PrivateKeySigner,
) -> anyhow::Result<impl AlloyProvider + Clone> {
    let url = Url::parse(rpc_url).context("invalid rpc url")?;
    let retry_layer = RetryBackoffLayer::new(10, 500, 1_000_000);
    let client = ClientBuilder::default().layer(retry_layer).http(url);
    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_client(client);
    Ok(provider)
}
