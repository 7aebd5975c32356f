// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Architecture-specific shims. AXON targets x86-64 only.

pub mod x86_64;
