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

use alloy_primitives::{Bytes, B256};
use alloy_transport::TransportError;

/// Result of a provider call
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Error enumeration for the provider traits
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The call reverted with the given data
    #[error("execution reverted: {0}")]
    Revert(Bytes),
    /// JSON-RPC or transport failure
    #[error("RPC error: {0}")]
    Rpc(String),
    /// The transaction was not mined in time
    #[error("timed out waiting for receipt of {0}")]
    ReceiptTimeout(B256),
    /// Internal errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<TransportError> for ProviderError {
    fn from(err: TransportError) -> Self {
        match err.as_error_resp().and_then(|resp| resp.as_revert_data()) {
            Some(data) => ProviderError::Revert(data),
            None => ProviderError::Rpc(err.to_string()),
        }
    }
}

impl From<alloy_contract::Error> for ProviderError {
    fn from(err: alloy_contract::Error) -> Self {
        match err {
            alloy_contract::Error::TransportError(err) => err.into(),
            other => ProviderError::Other(other.into()),
        }
    }
}
