// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for x86-64 four-level address spaces.

pub mod page_table;

pub use page_table::{MapError, PageFlags, PageTable, PAGE_SIZE};

#[cfg(test)]
mod tests;
