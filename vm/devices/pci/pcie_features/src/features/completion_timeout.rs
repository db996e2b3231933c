// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::io::ConfigSpaceAccess;
use crate::policy::Setting;
use crate::registry::FeatureError;
use crate::registry::FeatureId;
use crate::registry::PcieFeature;
use crate::topology::DeviceNode;
use crate::topology::PcieCapability;
use crate::walk::Order;

/// Policy bit requesting the completion timeout be disabled.
const DISABLE: u8 = 1 << 4;
/// Policy bits holding the Completion Timeout Value encoding.
const VALUE_MASK: u8 = 0xF;
const RANGE_SHIFT: u8 = 2;
const SUB_RANGE_MASK: u8 = 0b11;

/// Completion Timeout.
///
/// The policy holds the Completion Timeout Value encoding in bits 3:0 (bits
/// 3:2 select range A to D, bits 1:0 the lower or upper half of it) and the
/// Completion Timeout Disable request in bit 4.
pub(crate) struct CompletionTimeout;

impl CompletionTimeout {
    fn validate(cap: &PcieCapability, raw: u8) -> Result<(bool, u8), FeatureError> {
        let caps = cap.device_capabilities_2;
        let disable = raw & DISABLE != 0;
        if disable && !caps.completion_timeout_disable_supported() {
            return Err(Self::invalid(raw, "completion timeout disable not supported"));
        }

        let value = raw & VALUE_MASK;
        let range = value >> RANGE_SHIFT;
        if caps.completion_timeout_ranges_supported() & (1 << range) == 0 {
            return Err(Self::invalid(raw, "completion timeout range not supported"));
        }
        if !matches!(value & SUB_RANGE_MASK, 0b01 | 0b10) {
            return Err(Self::invalid(raw, "invalid completion timeout sub-range"));
        }

        Ok((disable, value))
    }
}

impl PcieFeature for CompletionTimeout {
    const ID: FeatureId = FeatureId::CompletionTimeout;
    const SCAN_ORDER: Option<Order> = None;
    const PROGRAM_ORDER: Order = Order::PreOrder;

    type Context = ();

    fn program(
        _ctx: &mut (),
        node: &mut DeviceNode,
        _level: usize,
        io: &mut dyn ConfigSpaceAccess,
    ) -> Result<(), FeatureError> {
        let DeviceNode {
            bdf,
            pcie: Some(cap),
            policy,
            ..
        } = node
        else {
            return Ok(());
        };
        let Setting::Value(raw) = policy.completion_timeout else {
            return Ok(());
        };

        let (disable, value) = Self::validate(cap, raw)?;
        if cap.update_device_control_2(io, *bdf, |ctl| {
            ctl.with_completion_timeout_disable(disable)
                .with_completion_timeout_value(value.into())
        })? {
            tracing::debug!(bdf = %bdf, disable, value, "programmed completion timeout");
        }
        Ok(())
    }

    fn committed(cap: &PcieCapability) -> Setting {
        let ctl = cap.device_control_2;
        let disable = if ctl.completion_timeout_disable() {
            DISABLE
        } else {
            0
        };
        Setting::Value(ctl.completion_timeout_value() as u8 | disable)
    }
}
