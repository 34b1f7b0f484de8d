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

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Bundler core types

mod bundle;
pub use bundle::{Bundle, BundleExecutionResult, BundleReceipt, UserOpExecutionResult};

mod config;
pub use config::{BundlerConfig, MempoolConfig, ReputationConfig};

mod mempool;
pub use mempool::{EntryState, MempoolEntry, MempoolStats};

mod reputation;
pub use reputation::{ReputationEntry, ReputationStatus};

mod revert;
pub use revert::EntryPointRevert;

mod timestamp;
pub use timestamp::Timestamp;

mod user_operation;
pub use user_operation::{pack_u128_pair, UserOperation};
