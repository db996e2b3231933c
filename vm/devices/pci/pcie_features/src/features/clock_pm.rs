// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Clock Power Management.

use crate::io::ConfigSpaceAccess;
use crate::policy::Setting;
use crate::registry::FeatureError;
use crate::registry::FeatureId;
use crate::registry::PcieFeature;
use crate::topology::DeviceNode;
use crate::topology::PcieCapability;
use crate::walk::Order;

/// Link Control Enable Clock Power Management, applied per device from a
/// concrete policy. A device that does not advertise Clock Power Management
/// in Link Capabilities always has it disabled.
pub(crate) struct ClockPowerManagement;

impl PcieFeature for ClockPowerManagement {
    const ID: FeatureId = FeatureId::ClockPowerManagement;
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
        let Setting::Value(v) = policy.clock_power_management else {
            return Ok(());
        };

        let enable = v & 1 != 0 && cap.link_capabilities.clock_power_management();
        if cap.update_link_control(io, *bdf, |ctl| {
            ctl.with_enable_clock_power_management(enable)
        })? {
            tracing::debug!(bdf = %bdf, enable, "programmed clock power management");
        }
        Ok(())
    }

    fn committed(cap: &PcieCapability) -> Setting {
        cap.link_control.enable_clock_power_management().into()
    }
}
