// SPDX-License-Identifier: MIT OR Apache-2.0
//! Library surface for the `wdp` CLI, split out so its commands and
//! formatting logic can be exercised directly from integration tests.

pub mod commands;
pub mod format;
