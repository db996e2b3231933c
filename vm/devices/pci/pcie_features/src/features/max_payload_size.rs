// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Max Payload Size: every device in a root port's subtree is programmed with
//! the smallest payload size supported anywhere in that subtree.

use crate::io::ConfigSpaceAccess;
use crate::policy::Setting;
use crate::registry::FeatureError;
use crate::registry::FeatureId;
use crate::registry::PcieFeature;
use crate::topology::DeviceNode;
use crate::topology::PcieCapability;
use crate::walk::Order;
use pci_core::spec::caps::pci_express::PayloadSize;

pub(crate) struct MaxPayloadSize;

impl PcieFeature for MaxPayloadSize {
    const ID: FeatureId = FeatureId::MaxPayloadSize;
    const SCAN_ORDER: Option<Order> = Some(Order::PostOrder);
    const PROGRAM_ORDER: Order = Order::PreOrder;

    /// Smallest effective capability seen so far.
    type Context = Option<u8>;

    fn scan(
        ctx: &mut Option<u8>,
        node: &mut DeviceNode,
        _level: usize,
    ) -> Result<(), FeatureError> {
        let Some(cap) = &node.pcie else {
            return Ok(());
        };

        // Reserved encodings are treated as the largest defined size.
        let mut effective =
            (cap.device_capabilities.max_payload_size() as u8).min(PayloadSize::MAX.0);
        // NotApplicable devices still count, they just are not reprogrammed.
        if let Setting::Value(policy) = node.policy.max_payload_size {
            effective = effective.min(policy);
        }

        *ctx = Some(ctx.map_or(effective, |min| min.min(effective)));
        Ok(())
    }

    fn program(
        ctx: &mut Option<u8>,
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
        let Some(mps) = *ctx else {
            return Ok(());
        };
        if policy.max_payload_size.is_not_applicable() {
            return Ok(());
        }

        policy.max_payload_size = Setting::Value(mps);
        if cap.update_device_control(io, *bdf, |ctl| ctl.with_max_payload_size(mps.into()))? {
            tracing::debug!(bdf = %bdf, mps, "programmed max payload size");
        }
        Ok(())
    }

    fn committed(cap: &PcieCapability) -> Setting {
        Setting::Value(cap.device_control.max_payload_size() as u8)
    }
}
