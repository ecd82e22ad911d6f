// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution backends.

pub mod mock;
pub mod process;
mod traits;

pub use mock::MockBackend;
pub use process::{ProcessBackend, ProcessBackendConfig};
pub use traits::*;
