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

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::SolValue;
use bundler_contracts::v0_7::PackedUserOperation;
use serde::{Deserialize, Deserializer, Serialize};

/// User operation in the v0.7 packed layout.
///
/// JSON field names match the `eth_sendUserOperation` packed form. Byte
/// fields that arrive as `null` or are omitted decode to empty (or
/// zero-filled for the fixed 32 byte fields), so every operation can be
/// encoded for `handleOps` without further normalization.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    /// Account sending the operation
    pub sender: Address,
    /// Account nonce
    #[serde(default, deserialize_with = "null_as_default")]
    pub nonce: U256,
    /// Factory address followed by factory calldata, empty for deployed accounts
    #[serde(default, deserialize_with = "null_as_default")]
    pub init_code: Bytes,
    /// Calldata for the account execution
    #[serde(default, deserialize_with = "null_as_default")]
    pub call_data: Bytes,
    /// `verificationGasLimit` (high 128 bits) and `callGasLimit` (low 128 bits)
    #[serde(default, deserialize_with = "null_as_default")]
    pub account_gas_limits: B256,
    /// Gas paid for calldata and bundle overhead
    #[serde(default, deserialize_with = "null_as_default")]
    pub pre_verification_gas: U256,
    /// `maxPriorityFeePerGas` (high 128 bits) and `maxFeePerGas` (low 128 bits)
    #[serde(default, deserialize_with = "null_as_default")]
    pub gas_fees: B256,
    /// Paymaster address, paymaster gas limits and paymaster data, empty when self-sponsored
    #[serde(default, deserialize_with = "null_as_default")]
    pub paymaster_and_data: Bytes,
    /// Account signature
    #[serde(default, deserialize_with = "null_as_default")]
    pub signature: Bytes,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl UserOperation {
    /// Hash of the operation as computed by the v0.7 entry point.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let inner = (
            self.sender,
            self.nonce,
            keccak256(&self.init_code),
            keccak256(&self.call_data),
            self.account_gas_limits,
            self.pre_verification_gas,
            self.gas_fees,
            keccak256(&self.paymaster_and_data),
        )
            .abi_encode();

        keccak256((keccak256(inner), entry_point, U256::from(chain_id)).abi_encode())
    }

    /// Contract representation passed to `handleOps`.
    pub fn pack(&self) -> PackedUserOperation {
        PackedUserOperation {
            sender: self.sender,
            nonce: self.nonce,
            initCode: self.init_code.clone(),
            callData: self.call_data.clone(),
            accountGasLimits: self.account_gas_limits,
            preVerificationGas: self.pre_verification_gas,
            gasFees: self.gas_fees,
            paymasterAndData: self.paymaster_and_data.clone(),
            signature: self.signature.clone(),
        }
    }

    /// Gas limit for account validation.
    pub fn verification_gas_limit(&self) -> u128 {
        split_u128_pair(&self.account_gas_limits).0
    }

    /// Gas limit for the account execution call.
    pub fn call_gas_limit(&self) -> u128 {
        split_u128_pair(&self.account_gas_limits).1
    }

    /// Priority fee cap, also the default bundling priority.
    pub fn max_priority_fee_per_gas(&self) -> u128 {
        split_u128_pair(&self.gas_fees).0
    }

    /// Total fee cap.
    pub fn max_fee_per_gas(&self) -> u128 {
        split_u128_pair(&self.gas_fees).1
    }

    /// Factory address, if the operation deploys its account.
    pub fn factory(&self) -> Option<Address> {
        address_prefix(&self.init_code)
    }

    /// Paymaster address, if the operation is sponsored.
    pub fn paymaster(&self) -> Option<Address> {
        address_prefix(&self.paymaster_and_data)
    }

    /// Paymaster validation gas limit, zero without a paymaster.
    pub fn paymaster_verification_gas_limit(&self) -> u128 {
        u128_at(&self.paymaster_and_data, 20)
    }

    /// Paymaster post-op gas limit, zero without a paymaster.
    pub fn paymaster_post_op_gas_limit(&self) -> u128 {
        u128_at(&self.paymaster_and_data, 36)
    }

    /// `verificationGasLimit + callGasLimit + preVerificationGas`, the per-op
    /// term of a bundle's gas estimate.
    pub fn operation_gas(&self) -> U256 {
        U256::from(self.verification_gas_limit())
            .saturating_add(U256::from(self.call_gas_limit()))
            .saturating_add(self.pre_verification_gas)
    }

    /// Maximum amount of wei the operation can be charged, i.e. its prefund.
    pub fn max_gas_cost(&self) -> U256 {
        self.operation_gas()
            .saturating_add(U256::from(self.paymaster_verification_gas_limit()))
            .saturating_add(U256::from(self.paymaster_post_op_gas_limit()))
            .saturating_mul(U256::from(self.max_fee_per_gas()))
    }
}

/// Packs two 128 bit values into a 32 byte word, `high` first, both big-endian.
pub fn pack_u128_pair(high: u128, low: u128) -> B256 {
    let (high, low) = (high.to_be_bytes(), low.to_be_bytes());
    B256::from(std::array::from_fn::<u8, 32, _>(|i| {
        if let Some(i) = i.checked_sub(16) {
            low[i]
        } else {
            high[i]
        }
    }))
}

fn split_u128_pair(word: &B256) -> (u128, u128) {
    let high: [u8; 16] = std::array::from_fn(|i| word[i]);
    let low: [u8; 16] = std::array::from_fn(|i| word[i + 16]);
    (u128::from_be_bytes(high), u128::from_be_bytes(low))
}

fn address_prefix(data: &Bytes) -> Option<Address> {
    (data.len() >= 20).then(|| Address::from_slice(&data[..20]))
}

fn u128_at(data: &Bytes, offset: usize) -> u128 {
    match data.get(offset..offset + 16) {
        Some(bytes) => {
            let word: [u8; 16] = std::array::from_fn(|i| bytes[i]);
            u128::from_be_bytes(word)
        }
        None => 0,
    }
}
