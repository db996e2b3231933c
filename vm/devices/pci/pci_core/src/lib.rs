// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core PCI register definitions shared by the PCI device crates.

#![forbid(unsafe_code)]

pub mod spec;
