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

/// Max Read Request Size. `Auto` follows the device's programmed Max Payload
/// Size, so this must run after [`super::MaxPayloadSize`].
pub(crate) struct MaxReadRequestSize;

impl PcieFeature for MaxReadRequestSize {
    const ID: FeatureId = FeatureId::MaxReadRequestSize;
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

        let mrrs = match policy.max_read_request_size {
            Setting::NotApplicable => return Ok(()),
            Setting::Auto => cap.device_control.max_payload_size() as u8,
            Setting::Value(v) => v,
        };

        policy.max_read_request_size = Setting::Value(mrrs);
        if cap.update_device_control(io, *bdf, |ctl| {
            ctl.with_max_read_request_size(mrrs.into())
        })? {
            tracing::debug!(bdf = %bdf, mrrs, "programmed max read request size");
        }
        Ok(())
    }

    fn committed(cap: &PcieCapability) -> Setting {
        Setting::Value(cap.device_control.max_read_request_size() as u8)
    }
}
