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

//! Traits for the chain-submission side of the bundler

mod entry_point;
pub use entry_point::BundleHandler;
#[cfg(feature = "test-utils")]
pub use entry_point::MockBundleHandler;

mod error;
pub use error::{ProviderError, ProviderResult};
