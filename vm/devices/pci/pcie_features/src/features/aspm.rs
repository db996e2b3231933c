// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ROOT_PORT_LEVEL;
use crate::io::ConfigSpaceAccess;
use crate::policy::Setting;
use crate::registry::FeatureError;
use crate::registry::FeatureId;
use crate::registry::PcieFeature;
use crate::topology::DeviceNode;
use crate::topology::PcieCapability;
use crate::walk::Order;

/// ASPM Control.
///
/// The root port's policy decides the ASPM states of its whole subtree,
/// limited to the states every link in the subtree supports. A root port
/// policy of `Auto` or `NotApplicable` leaves the subtree alone.
pub(crate) struct AspmControl;

#[derive(Default)]
pub(crate) struct AspmContext {
    /// ASPM states supported by every function in the subtree.
    common: Option<u8>,
    /// Requested states, from the root port's policy.
    requested: Option<u8>,
}

impl PcieFeature for AspmControl {
    const ID: FeatureId = FeatureId::AspmControl;
    const SCAN_ORDER: Option<Order> = Some(Order::PostOrder);
    const PROGRAM_ORDER: Order = Order::PreOrder;

    type Context = AspmContext;

    fn scan(
        ctx: &mut AspmContext,
        node: &mut DeviceNode,
        _level: usize,
    ) -> Result<(), FeatureError> {
        let Some(cap) = &node.pcie else {
            return Ok(());
        };
        let supported = cap.link_capabilities.aspm_support() as u8;
        ctx.common = Some(ctx.common.map_or(supported, |common| common & supported));
        Ok(())
    }

    fn program(
        ctx: &mut AspmContext,
        node: &mut DeviceNode,
        level: usize,
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

        if level == ROOT_PORT_LEVEL {
            ctx.requested = policy.aspm_control.value();
        }
        let (Some(requested), Some(common)) = (ctx.requested, ctx.common) else {
            return Ok(());
        };
        if policy.aspm_control.is_not_applicable() {
            return Ok(());
        }

        let aspm = requested & common;
        policy.aspm_control = Setting::Value(aspm);
        if cap.update_link_control(io, *bdf, |ctl| ctl.with_aspm_control(aspm.into()))? {
            tracing::debug!(bdf = %bdf, aspm, "programmed aspm control");
        }
        Ok(())
    }

    fn committed(cap: &PcieCapability) -> Setting {
        Setting::Value(cap.link_control.aspm_control() as u8)
    }
}
