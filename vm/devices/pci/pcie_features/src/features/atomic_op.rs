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

const REQUESTER_ENABLE: u8 = 1 << 0;
const EGRESS_BLOCKING: u8 = 1 << 1;

/// AtomicOp Requester Enable (policy bit 0) and AtomicOp Egress Blocking
/// (policy bit 1).
pub(crate) struct AtomicOp;

impl PcieFeature for AtomicOp {
    const ID: FeatureId = FeatureId::AtomicOp;
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
        let Setting::Value(raw) = policy.atomic_op else {
            return Ok(());
        };
        if raw & !(REQUESTER_ENABLE | EGRESS_BLOCKING) != 0 {
            return Err(Self::invalid(raw, "reserved atomic op policy bits set"));
        }

        let requester = raw & REQUESTER_ENABLE != 0;
        // Egress blocking only means something on a port that routes AtomicOps.
        let egress_blocking = raw & EGRESS_BLOCKING != 0
            && cap.device_capabilities_2.atomic_op_routing_supported();
        if cap.update_device_control_2(io, *bdf, |ctl| {
            ctl.with_atomic_op_requester_enable(requester)
                .with_atomic_op_egress_blocking(egress_blocking)
        })? {
            tracing::debug!(bdf = %bdf, requester, egress_blocking, "programmed atomic op");
        }
        Ok(())
    }

    fn committed(cap: &PcieCapability) -> Setting {
        let ctl = cap.device_control_2;
        let mut value = 0;
        if ctl.atomic_op_requester_enable() {
            value |= REQUESTER_ENABLE;
        }
        if ctl.atomic_op_egress_blocking() {
            value |= EGRESS_BLOCKING;
        }
        Setting::Value(value)
    }
}
