// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The closed set of features known to the engine, and the table that drives
//! them.

use crate::ROOT_PORT_LEVEL;
use crate::features;
use crate::io::ConfigSpaceAccess;
use crate::io::ConfigSpaceError;
use crate::policy::Setting;
use crate::topology::Bdf;
use crate::topology::DeviceNode;
use crate::topology::PcieCapability;
use crate::walk::Order;
use crate::walk::walk;
use bitfield_struct::bitfield;
use std::fmt;
use thiserror::Error;

/// A feature of the device policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureId {
    /// Device Control Max_Payload_Size.
    MaxPayloadSize,
    /// Device Control Max_Read_Request_Size.
    MaxReadRequestSize,
    /// Extended Tag Field Enable and 10-Bit Tag Requester Enable.
    ExtendedTag,
    /// Device Control Enable Relaxed Ordering.
    RelaxedOrdering,
    /// Device Control Enable No Snoop.
    NoSnoop,
    /// Link Control ASPM Control.
    AspmControl,
    /// Link Control Common Clock Configuration.
    CommonClockConfiguration,
    /// AtomicOp Requester Enable and AtomicOp Egress Blocking.
    AtomicOp,
    /// LTR Mechanism Enable.
    Ltr,
    /// Precision Time Measurement. Not implemented.
    Ptm,
    /// Completion Timeout Value and Completion Timeout Disable.
    CompletionTimeout,
    /// Link Control Enable Clock Power Management.
    ClockPowerManagement,
    /// L1 PM Substates. Not implemented.
    L1PmSubstates,
}

impl FeatureId {
    /// Every feature, in policy order.
    pub const ALL: [FeatureId; 13] = [
        FeatureId::MaxPayloadSize,
        FeatureId::MaxReadRequestSize,
        FeatureId::ExtendedTag,
        FeatureId::RelaxedOrdering,
        FeatureId::NoSnoop,
        FeatureId::AspmControl,
        FeatureId::CommonClockConfiguration,
        FeatureId::AtomicOp,
        FeatureId::Ltr,
        FeatureId::Ptm,
        FeatureId::CompletionTimeout,
        FeatureId::ClockPowerManagement,
        FeatureId::L1PmSubstates,
    ];

    /// A short human readable name.
    pub const fn name(self) -> &'static str {
        match self {
            FeatureId::MaxPayloadSize => "max payload size",
            FeatureId::MaxReadRequestSize => "max read request size",
            FeatureId::ExtendedTag => "extended tag",
            FeatureId::RelaxedOrdering => "relaxed ordering",
            FeatureId::NoSnoop => "no snoop",
            FeatureId::AspmControl => "aspm control",
            FeatureId::CommonClockConfiguration => "common clock configuration",
            FeatureId::AtomicOp => "atomic op",
            FeatureId::Ltr => "ltr",
            FeatureId::Ptm => "ptm",
            FeatureId::CompletionTimeout => "completion timeout",
            FeatureId::ClockPowerManagement => "clock power management",
            FeatureId::L1PmSubstates => "l1 pm substates",
        }
    }

    /// The largest legal policy value. `None` if the feature only accepts
    /// `Auto` and `NotApplicable`.
    pub const fn max_value(self) -> Option<u8> {
        match self {
            FeatureId::MaxPayloadSize | FeatureId::MaxReadRequestSize => Some(5),
            FeatureId::ExtendedTag | FeatureId::AtomicOp | FeatureId::AspmControl => Some(0b11),
            FeatureId::RelaxedOrdering
            | FeatureId::NoSnoop
            | FeatureId::Ltr
            | FeatureId::Ptm
            | FeatureId::ClockPowerManagement => Some(1),
            FeatureId::CompletionTimeout => Some(0x1F),
            FeatureId::L1PmSubstates => Some(0xF),
            FeatureId::CommonClockConfiguration => None,
        }
    }

    const fn mask(self) -> u32 {
        1 << self as u32
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of features. Bit `n` corresponds to `FeatureId::ALL[n]`.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FeatureSet {
    /// [`FeatureId::MaxPayloadSize`]
    pub max_payload_size: bool,
    /// [`FeatureId::MaxReadRequestSize`]
    pub max_read_request_size: bool,
    /// [`FeatureId::ExtendedTag`]
    pub extended_tag: bool,
    /// [`FeatureId::RelaxedOrdering`]
    pub relaxed_ordering: bool,
    /// [`FeatureId::NoSnoop`]
    pub no_snoop: bool,
    /// [`FeatureId::AspmControl`]
    pub aspm_control: bool,
    /// [`FeatureId::CommonClockConfiguration`]
    pub common_clock_configuration: bool,
    /// [`FeatureId::AtomicOp`]
    pub atomic_op: bool,
    /// [`FeatureId::Ltr`]
    pub ltr: bool,
    /// [`FeatureId::Ptm`]
    pub ptm: bool,
    /// [`FeatureId::CompletionTimeout`]
    pub completion_timeout: bool,
    /// [`FeatureId::ClockPowerManagement`]
    pub clock_power_management: bool,
    /// [`FeatureId::L1PmSubstates`]
    pub l1_pm_substates: bool,
    #[bits(19)]
    _reserved: u32,
}

impl FeatureSet {
    /// Returns true if `id` is in the set.
    pub fn contains(&self, id: FeatureId) -> bool {
        self.into_bits() & id.mask() != 0
    }

    /// Adds or removes `id`.
    pub fn with_feature(self, id: FeatureId, enabled: bool) -> Self {
        let bits = self.into_bits() & !id.mask();
        Self::from_bits(if enabled { bits | id.mask() } else { bits })
    }

    /// The features present in both sets.
    pub fn intersection(self, other: FeatureSet) -> Self {
        Self::from_bits(self.into_bits() & other.into_bits())
    }

    /// The features present in `self` but not in `other`.
    pub fn difference(self, other: FeatureSet) -> Self {
        Self::from_bits(self.into_bits() & !other.into_bits())
    }

    /// Returns true if the set holds no feature.
    pub fn is_empty(&self) -> bool {
        self.into_bits() == 0
    }

    /// The features in the set, in policy order.
    pub fn iter(self) -> impl Iterator<Item = FeatureId> {
        FeatureId::ALL.into_iter().filter(move |&id| self.contains(id))
    }
}

impl FromIterator<FeatureId> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = FeatureId>>(iter: I) -> Self {
        iter.into_iter()
            .fold(FeatureSet::new(), |set, id| set.with_feature(id, true))
    }
}

/// Features with an implementation, in the order they are negotiated.
pub const REGISTRY: [FeatureId; 11] = [
    FeatureId::MaxPayloadSize,
    FeatureId::MaxReadRequestSize,
    FeatureId::ExtendedTag,
    FeatureId::RelaxedOrdering,
    FeatureId::NoSnoop,
    FeatureId::AspmControl,
    FeatureId::CommonClockConfiguration,
    FeatureId::AtomicOp,
    FeatureId::Ltr,
    FeatureId::CompletionTimeout,
    FeatureId::ClockPowerManagement,
];

/// The set of features the engine can configure.
pub fn implemented() -> FeatureSet {
    REGISTRY.into_iter().collect()
}

/// Which features the engine offers to configure on the platform's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureConfig {
    offered: FeatureSet,
}

impl FeatureConfig {
    /// Offers every implemented feature.
    pub fn all() -> Self {
        Self {
            offered: implemented(),
        }
    }

    /// Offers nothing.
    pub fn none() -> Self {
        Self {
            offered: FeatureSet::new(),
        }
    }

    /// Builds a configuration from a raw feature mask, as stored by platform
    /// firmware. Unimplemented features are dropped from the mask.
    pub fn from_mask(mask: u32) -> Self {
        let requested = FeatureSet::from_bits(mask);
        let unknown = requested.difference(implemented());
        if !unknown.is_empty() {
            tracing::warn!(
                mask = unknown.into_bits(),
                "ignoring unimplemented pcie features"
            );
        }
        Self {
            offered: requested.intersection(implemented()),
        }
    }

    /// Offers or stops offering `id`. Unimplemented features are never
    /// offered.
    pub fn with_feature(mut self, id: FeatureId, enabled: bool) -> Self {
        self.offered = self
            .offered
            .with_feature(id, enabled && implemented().contains(id));
        self
    }

    /// The features offered to the platform.
    pub fn offered(&self) -> FeatureSet {
        self.offered
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self::all()
    }
}

/// Error raised by a feature on one device.
#[derive(Debug, Error)]
pub enum FeatureError {
    /// The policy can not be applied to the device.
    #[error("invalid {feature} policy {value:#x}: {reason}")]
    InvalidParameter {
        /// The feature being configured.
        feature: FeatureId,
        /// The offending policy value.
        value: u8,
        /// Why the value was rejected.
        reason: &'static str,
    },
    /// Accessing the device failed.
    #[error("config space access failed")]
    Io(#[from] ConfigSpaceError),
}

/// A failure recorded while running a feature.
#[derive(Debug)]
pub struct FeatureFailure {
    /// The device the failure occurred on.
    pub bdf: Bdf,
    /// The feature being negotiated.
    pub feature: FeatureId,
    /// The error.
    pub error: FeatureError,
}

/// One feature's algorithm.
///
/// A feature is run once per root port subtree. A fresh `Context` is created,
/// passed to `scan` for every node (if the feature scans), then to `program`
/// for every node, then dropped.
pub(crate) trait PcieFeature {
    const ID: FeatureId;
    /// Walk order of the scan phase, or `None` if the feature has no scan.
    const SCAN_ORDER: Option<Order>;
    const PROGRAM_ORDER: Order;

    type Context: Default;

    fn scan(
        _ctx: &mut Self::Context,
        _node: &mut DeviceNode,
        _level: usize,
    ) -> Result<(), FeatureError> {
        Ok(())
    }

    fn program(
        ctx: &mut Self::Context,
        node: &mut DeviceNode,
        level: usize,
        io: &mut dyn ConfigSpaceAccess,
    ) -> Result<(), FeatureError>;

    /// The feature's committed value, as reported to the platform.
    fn committed(cap: &PcieCapability) -> Setting;

    fn invalid(value: u8, reason: &'static str) -> FeatureError {
        FeatureError::InvalidParameter {
            feature: Self::ID,
            value,
            reason,
        }
    }
}

/// Runs the scan and program phases of `id` over the subtree rooted at
/// `root`, which sits at [`ROOT_PORT_LEVEL`].
pub(crate) fn run_feature(
    id: FeatureId,
    root: &mut DeviceNode,
    io: &mut dyn ConfigSpaceAccess,
    failures: &mut Vec<FeatureFailure>,
) {
    match id {
        FeatureId::MaxPayloadSize => run::<features::MaxPayloadSize>(root, io, failures),
        FeatureId::MaxReadRequestSize => run::<features::MaxReadRequestSize>(root, io, failures),
        FeatureId::ExtendedTag => run::<features::ExtendedTag>(root, io, failures),
        FeatureId::RelaxedOrdering => run::<features::RelaxedOrdering>(root, io, failures),
        FeatureId::NoSnoop => run::<features::NoSnoop>(root, io, failures),
        FeatureId::AspmControl => run::<features::AspmControl>(root, io, failures),
        FeatureId::CommonClockConfiguration => {
            run::<features::CommonClockConfiguration>(root, io, failures)
        }
        FeatureId::AtomicOp => run::<features::AtomicOp>(root, io, failures),
        FeatureId::Ltr => run::<features::Ltr>(root, io, failures),
        FeatureId::CompletionTimeout => run::<features::CompletionTimeout>(root, io, failures),
        FeatureId::ClockPowerManagement => {
            run::<features::ClockPowerManagement>(root, io, failures)
        }
        FeatureId::Ptm | FeatureId::L1PmSubstates => {
            tracing::debug!(feature = %id, "feature not implemented, skipping");
        }
    }
}

/// The committed value of `id` on a device, or `NotApplicable` for
/// unimplemented features.
pub(crate) fn committed_setting(id: FeatureId, cap: &PcieCapability) -> Setting {
    match id {
        FeatureId::MaxPayloadSize => features::MaxPayloadSize::committed(cap),
        FeatureId::MaxReadRequestSize => features::MaxReadRequestSize::committed(cap),
        FeatureId::ExtendedTag => features::ExtendedTag::committed(cap),
        FeatureId::RelaxedOrdering => features::RelaxedOrdering::committed(cap),
        FeatureId::NoSnoop => features::NoSnoop::committed(cap),
        FeatureId::AspmControl => features::AspmControl::committed(cap),
        FeatureId::CommonClockConfiguration => features::CommonClockConfiguration::committed(cap),
        FeatureId::AtomicOp => features::AtomicOp::committed(cap),
        FeatureId::Ltr => features::Ltr::committed(cap),
        FeatureId::CompletionTimeout => features::CompletionTimeout::committed(cap),
        FeatureId::ClockPowerManagement => features::ClockPowerManagement::committed(cap),
        FeatureId::Ptm | FeatureId::L1PmSubstates => {
            Setting::NotApplicable
        }
    }
}

fn run<F: PcieFeature>(
    root: &mut DeviceNode,
    io: &mut dyn ConfigSpaceAccess,
    failures: &mut Vec<FeatureFailure>,
) {
    let mut ctx = F::Context::default();
    let mut record = |(bdf, error): (Bdf, FeatureError)| {
        failures.push(FeatureFailure {
            bdf,
            feature: F::ID,
            error,
        })
    };

    if let Some(order) = F::SCAN_ORDER {
        walk(root, order, ROOT_PORT_LEVEL, &mut |node, level| {
            F::scan(&mut ctx, node, level)
        })
        .into_iter()
        .for_each(&mut record);
    }

    walk(root, F::PROGRAM_ORDER, ROOT_PORT_LEVEL, &mut |node, level| {
        F::program(&mut ctx, node, level, io)
    })
    .into_iter()
    .for_each(&mut record);
}
