// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud collaborators: instance provisioning and remote command dispatch.
//!
//! Only the contracts live here. Production deployments plug in an adapter
//! for their provider; tests use the recording mocks.

pub mod mock;
mod traits;

pub use mock::{MockCommandChannel, MockProvider, ProviderEvent};
pub use traits::*;
