// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hierarchy-wide negotiation and programming of PCI Express device control
//! features.
//!
//! Given a snapshot of the PCI Express devices below a root bridge, the engine
//! resolves a per-device policy from the platform, aligns every enabled
//! feature across each root port's subtree (for example the smallest common
//! Max Payload Size, or LTR enablement of every bridge above an LTR-capable
//! endpoint), commits the result to configuration space, and reports the final
//! state of every device back to the platform.

#![forbid(unsafe_code)]

mod features;
pub mod io;
pub mod negotiate;
pub mod policy;
pub mod registry;
pub mod topology;
pub mod walk;

#[cfg(test)]
mod test_helpers;

pub use io::ConfigSpaceAccess;
pub use io::ConfigSpaceError;
pub use negotiate::FeatureEngine;
pub use negotiate::NegotiationError;
pub use negotiate::NegotiationReport;
pub use negotiate::enumerate_root_bridge_features;
pub use policy::DevicePolicy;
pub use policy::DeviceState;
pub use policy::PlatformProtocol;
pub use policy::Setting;
pub use registry::FeatureConfig;
pub use registry::FeatureId;
pub use registry::FeatureSet;
pub use topology::Bdf;
pub use topology::DeviceNode;
pub use topology::PcieCapability;
pub use topology::RootBridge;

/// Level assigned to the immediate children of a root bridge (the root ports)
/// when walking a hierarchy.
pub const ROOT_PORT_LEVEL: usize = 1;

/// Deepest possible PCI Express hierarchy: one level per bus number below the
/// root bridge.
pub const MAX_HIERARCHY_DEPTH: usize = 256;
