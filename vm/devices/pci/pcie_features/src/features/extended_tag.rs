// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Extended Tag.
//!
//! Policy bit 0 enables 8-bit tags (Extended Tag Field Enable), bit 1 enables
//! 10-bit tags as a requester. An endpoint may only use 10-bit tags if the
//! root port above it can complete 10-bit tagged requests, so the root port's
//! completer capability is cached when the walk enters the subtree.

use crate::ROOT_PORT_LEVEL;
use crate::io::ConfigSpaceAccess;
use crate::policy::Setting;
use crate::registry::FeatureError;
use crate::registry::FeatureId;
use crate::registry::PcieFeature;
use crate::topology::DeviceNode;
use crate::topology::PcieCapability;
use crate::walk::Order;

const EIGHT_BIT: u8 = 1 << 0;
const TEN_BIT: u8 = 1 << 1;

pub(crate) struct ExtendedTag;

impl PcieFeature for ExtendedTag {
    const ID: FeatureId = FeatureId::ExtendedTag;
    const SCAN_ORDER: Option<Order> = None;
    const PROGRAM_ORDER: Order = Order::PreOrder;

    /// Whether the root port of the subtree is a 10-bit tag completer.
    type Context = Option<bool>;

    fn program(
        ctx: &mut Option<bool>,
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

        if level == ROOT_PORT_LEVEL && ctx.is_none() {
            let completer = cap.device_capabilities_2.ten_bit_tag_completer_supported();
            tracing::debug!(bdf = %bdf, completer, "root port 10-bit tag completer");
            *ctx = Some(completer);
        }

        let Setting::Value(raw) = policy.extended_tag else {
            return Ok(());
        };
        if raw & !(EIGHT_BIT | TEN_BIT) != 0 {
            return Err(Self::invalid(raw, "reserved extended tag policy bits set"));
        }

        let ten_bit = raw & TEN_BIT != 0
            && cap.device_capabilities_2.ten_bit_tag_requester_supported()
            && (!cap.port_type().is_endpoint() || ctx.unwrap_or(false));
        if cap.update_device_control_2(io, *bdf, |ctl| {
            ctl.with_ten_bit_tag_requester_enable(ten_bit)
        })? {
            tracing::debug!(bdf = %bdf, ten_bit, "programmed 10-bit tag requester enable");
        }
        if ten_bit {
            return Ok(());
        }

        let eight_bit = raw & EIGHT_BIT != 0 && cap.device_capabilities.ext_tag_field();
        if cap.update_device_control(io, *bdf, |ctl| ctl.with_extended_tag_enable(eight_bit))? {
            tracing::debug!(bdf = %bdf, eight_bit, "programmed extended tag field enable");
        }
        Ok(())
    }

    fn committed(cap: &PcieCapability) -> Setting {
        let mut value = 0;
        if cap.device_control.extended_tag_enable() {
            value |= EIGHT_BIT;
        }
        if cap.device_control_2.ten_bit_tag_requester_enable() {
            value |= TEN_BIT;
        }
        Setting::Value(value)
    }
}
