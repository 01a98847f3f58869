// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External control plane clients.
//!
//! [`ExternalClient`] is the contract the engine needs from the cluster
//! provisioning control plane. [`HttpExternalClient`] talks to the real
//! gateway; [`MockExternalClient`] is a deterministic in-memory double that
//! records every call.

pub mod http;
pub mod mock;
mod traits;

pub use http::HttpExternalClient;
pub use mock::{MockExternalClient, MockOperation, RecordedCall};
pub use traits::*;
