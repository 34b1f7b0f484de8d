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
//! Bundle execution and the bundling loop for the bundler.

mod bundler;
pub use bundler::{Bundler, BundlerError};

mod emit;
pub use emit::{BuilderEvent, BuilderEventKind};

mod executor;
#[cfg(feature = "test-utils")]
pub use executor::MockBundleExecutor;
pub use executor::{estimate_gas, BundleError, BundleExecutor, BundleExecutorImpl, Simulation};

mod reconcile;

mod task;
pub use task::BundlerTask;
