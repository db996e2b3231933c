// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-device feature policy, and the platform interfaces that supply it and
//! receive the final device state.

use crate::registry::FeatureId;
use crate::registry::FeatureSet;
use crate::topology::Bdf;
use crate::topology::RootBridgeId;
use thiserror::Error;

/// One field of a [`DevicePolicy`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Setting {
    /// Let the engine pick the value.
    Auto,
    /// Never touch the field.
    NotApplicable,
    /// A concrete, feature-specific value.
    Value(u8),
}

impl Setting {
    /// Raw encoding of [`Setting::Auto`].
    pub const AUTO_RAW: u8 = 0xFF;
    /// Raw encoding of [`Setting::NotApplicable`].
    pub const NOT_APPLICABLE_RAW: u8 = 0xFE;

    /// Decodes the raw byte encoding used by platform firmware.
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            Self::AUTO_RAW => Setting::Auto,
            Self::NOT_APPLICABLE_RAW => Setting::NotApplicable,
            v => Setting::Value(v),
        }
    }

    /// Encodes the setting as a raw byte.
    pub const fn into_raw(self) -> u8 {
        match self {
            Setting::Auto => Self::AUTO_RAW,
            Setting::NotApplicable => Self::NOT_APPLICABLE_RAW,
            Setting::Value(v) => v,
        }
    }

    /// The concrete value, if any.
    pub const fn value(self) -> Option<u8> {
        match self {
            Setting::Value(v) => Some(v),
            Setting::Auto | Setting::NotApplicable => None,
        }
    }

    /// Returns true for [`Setting::NotApplicable`].
    pub const fn is_not_applicable(self) -> bool {
        matches!(self, Setting::NotApplicable)
    }

    fn formalize(self, max: Option<u8>) -> Self {
        match (self, max) {
            (Setting::Value(v), Some(max)) if v <= max => self,
            (Setting::Value(_), _) => Setting::NotApplicable,
            (Setting::Auto | Setting::NotApplicable, _) => self,
        }
    }
}

impl From<bool> for Setting {
    fn from(enabled: bool) -> Self {
        Setting::Value(enabled.into())
    }
}

/// The policy of one device: a [`Setting`] per feature.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[expect(missing_docs)] // one field per FeatureId
pub struct DevicePolicy {
    pub max_payload_size: Setting,
    pub max_read_request_size: Setting,
    pub extended_tag: Setting,
    pub relaxed_ordering: Setting,
    pub no_snoop: Setting,
    pub aspm_control: Setting,
    pub common_clock_configuration: Setting,
    pub atomic_op: Setting,
    pub ltr: Setting,
    pub ptm: Setting,
    pub completion_timeout: Setting,
    pub clock_power_management: Setting,
    pub l1_pm_substates: Setting,
}

/// The committed state of a device, reported to the platform once
/// negotiation finishes. Never holds [`Setting::Auto`].
pub type DeviceState = DevicePolicy;

impl DevicePolicy {
    /// A policy with every field set to `setting`.
    pub const fn uniform(setting: Setting) -> Self {
        Self {
            max_payload_size: setting,
            max_read_request_size: setting,
            extended_tag: setting,
            relaxed_ordering: setting,
            no_snoop: setting,
            aspm_control: setting,
            common_clock_configuration: setting,
            atomic_op: setting,
            ltr: setting,
            ptm: setting,
            completion_timeout: setting,
            clock_power_management: setting,
            l1_pm_substates: setting,
        }
    }

    /// A policy that leaves every feature alone.
    pub const fn not_applicable() -> Self {
        Self::uniform(Setting::NotApplicable)
    }

    /// The default policy of a run: `Auto` for enabled features,
    /// `NotApplicable` for the others.
    pub fn template(enabled: FeatureSet) -> Self {
        let mut policy = Self::not_applicable();
        for id in enabled.iter() {
            *policy.get_mut(id) = Setting::Auto;
        }
        policy
    }

    /// The setting of `id`.
    pub fn get(&self, id: FeatureId) -> Setting {
        match id {
            FeatureId::MaxPayloadSize => self.max_payload_size,
            FeatureId::MaxReadRequestSize => self.max_read_request_size,
            FeatureId::ExtendedTag => self.extended_tag,
            FeatureId::RelaxedOrdering => self.relaxed_ordering,
            FeatureId::NoSnoop => self.no_snoop,
            FeatureId::AspmControl => self.aspm_control,
            FeatureId::CommonClockConfiguration => self.common_clock_configuration,
            FeatureId::AtomicOp => self.atomic_op,
            FeatureId::Ltr => self.ltr,
            FeatureId::Ptm => self.ptm,
            FeatureId::CompletionTimeout => self.completion_timeout,
            FeatureId::ClockPowerManagement => self.clock_power_management,
            FeatureId::L1PmSubstates => self.l1_pm_substates,
        }
    }

    /// Mutable access to the setting of `id`.
    pub fn get_mut(&mut self, id: FeatureId) -> &mut Setting {
        match id {
            FeatureId::MaxPayloadSize => &mut self.max_payload_size,
            FeatureId::MaxReadRequestSize => &mut self.max_read_request_size,
            FeatureId::ExtendedTag => &mut self.extended_tag,
            FeatureId::RelaxedOrdering => &mut self.relaxed_ordering,
            FeatureId::NoSnoop => &mut self.no_snoop,
            FeatureId::AspmControl => &mut self.aspm_control,
            FeatureId::CommonClockConfiguration => &mut self.common_clock_configuration,
            FeatureId::AtomicOp => &mut self.atomic_op,
            FeatureId::Ltr => &mut self.ltr,
            FeatureId::Ptm => &mut self.ptm,
            FeatureId::CompletionTimeout => &mut self.completion_timeout,
            FeatureId::ClockPowerManagement => &mut self.clock_power_management,
            FeatureId::L1PmSubstates => &mut self.l1_pm_substates,
        }
    }

    /// Replaces every value outside its feature's legal range with
    /// `NotApplicable`.
    pub fn formalize(&mut self) {
        for id in FeatureId::ALL {
            let setting = self.get_mut(id);
            let formal = setting.formalize(id.max_value());
            if formal != *setting {
                tracing::warn!(
                    feature = %id,
                    value = setting.into_raw(),
                    "policy value out of range, treating as not applicable"
                );
                *setting = formal;
            }
        }
    }

    /// Sets every feature outside `enabled` to `NotApplicable`.
    pub fn restrict(&mut self, enabled: FeatureSet) {
        for id in FeatureId::ALL {
            if !enabled.contains(id) {
                *self.get_mut(id) = Setting::NotApplicable;
            }
        }
    }

    /// Decodes a policy from its raw byte encoding, in [`FeatureId::ALL`]
    /// order.
    pub fn from_raw(raw: [u8; 13]) -> Self {
        let mut policy = Self::not_applicable();
        for (id, raw) in FeatureId::ALL.into_iter().zip(raw) {
            *policy.get_mut(id) = Setting::from_raw(raw);
        }
        policy
    }

    /// Encodes the policy as raw bytes, in [`FeatureId::ALL`] order.
    pub fn into_raw(&self) -> [u8; 13] {
        FeatureId::ALL.map(|id| self.get(id).into_raw())
    }
}

/// Error returned by a [`PolicySource`].
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The platform has no opinion. The built-in defaults are used.
    #[error("no platform policy")]
    Unsupported,
    /// The request was malformed.
    #[error("invalid policy request")]
    InvalidParameter,
    /// The platform failed to produce a policy.
    #[error("platform policy failure: {0}")]
    Platform(String),
}

/// Platform component deciding which features to configure and how.
pub trait PolicySource {
    /// Called once before any device is touched. `supported` holds the
    /// features the engine is able and configured to handle; the platform
    /// returns the ones it wants configured.
    fn get_policy(&mut self, supported: FeatureSet) -> Result<FeatureSet, PolicyError>;

    /// Fills in the policy of one device. `policy` arrives holding the
    /// defaults of the run.
    fn get_device_policy(
        &mut self,
        root_bridge: RootBridgeId,
        bdf: Bdf,
        policy: &mut DevicePolicy,
    ) -> Result<(), PolicyError>;
}

/// Platform component receiving the final state of every device.
pub trait NotificationSink {
    /// Reports the committed state of one device.
    fn notify_device_state(
        &mut self,
        root_bridge: RootBridgeId,
        bdf: Bdf,
        state: &DeviceState,
    ) -> Result<(), PolicyError>;
}

/// A platform that both supplies policy and receives notifications.
pub trait PlatformProtocol: PolicySource + NotificationSink {}

impl<T: PolicySource + NotificationSink + ?Sized> PlatformProtocol for T {}
