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

/// Common Clock Configuration.
///
/// With an `Auto` policy the Link Control bit follows Slot Clock
/// Configuration, i.e. it is set when the link partners share a reference
/// clock. The link is not retrained afterwards.
pub(crate) struct CommonClockConfiguration;

impl PcieFeature for CommonClockConfiguration {
    const ID: FeatureId = FeatureId::CommonClockConfiguration;
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
        if policy.common_clock_configuration != Setting::Auto {
            return Ok(());
        }

        let common = cap.link_status.slot_clock_configuration();
        if cap.update_link_control(io, *bdf, |ctl| ctl.with_common_clock_configuration(common))? {
            tracing::debug!(bdf = %bdf, common, "programmed common clock configuration");
        }
        Ok(())
    }

    fn committed(cap: &PcieCapability) -> Setting {
        cap.link_control.common_clock_configuration().into()
    }
}
