// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Relaxed Ordering and No Snoop. Both are plain per-device enables: only a
//! concrete policy value is applied, `Auto` leaves the device alone.

use crate::io::ConfigSpaceAccess;
use crate::policy::Setting;
use crate::registry::FeatureError;
use crate::registry::FeatureId;
use crate::registry::PcieFeature;
use crate::topology::Bdf;
use crate::topology::DeviceNode;
use crate::topology::PcieCapability;
use crate::walk::Order;
use pci_core::spec::caps::pci_express::DeviceControl;

pub(crate) struct RelaxedOrdering;

pub(crate) struct NoSnoop;

fn program_enable(
    feature: FeatureId,
    setting: Setting,
    cap: &mut PcieCapability,
    bdf: Bdf,
    io: &mut dyn ConfigSpaceAccess,
    set: fn(DeviceControl, bool) -> DeviceControl,
) -> Result<(), FeatureError> {
    let Setting::Value(v) = setting else {
        return Ok(());
    };

    let enable = v != 0;
    if cap.update_device_control(io, bdf, |ctl| set(ctl, enable))? {
        tracing::debug!(bdf = %bdf, feature = %feature, enable, "programmed device control");
    }
    Ok(())
}

impl PcieFeature for RelaxedOrdering {
    const ID: FeatureId = FeatureId::RelaxedOrdering;
    const SCAN_ORDER: Option<Order> = None;
    const PROGRAM_ORDER: Order = Order::PreOrder;

    type Context = ();

    fn program(
        _ctx: &mut (),
        node: &mut DeviceNode,
        _level: usize,
        io: &mut dyn ConfigSpaceAccess,
    ) -> Result<(), FeatureError> {
        let Some(cap) = &mut node.pcie else {
            return Ok(());
        };
        program_enable(
            Self::ID,
            node.policy.relaxed_ordering,
            cap,
            node.bdf,
            io,
            DeviceControl::with_enable_relaxed_ordering,
        )
    }

    fn committed(cap: &PcieCapability) -> Setting {
        cap.device_control.enable_relaxed_ordering().into()
    }
}

impl PcieFeature for NoSnoop {
    const ID: FeatureId = FeatureId::NoSnoop;
    const SCAN_ORDER: Option<Order> = None;
    const PROGRAM_ORDER: Order = Order::PreOrder;

    type Context = ();

    fn program(
        _ctx: &mut (),
        node: &mut DeviceNode,
        _level: usize,
        io: &mut dyn ConfigSpaceAccess,
    ) -> Result<(), FeatureError> {
        let Some(cap) = &mut node.pcie else {
            return Ok(());
        };
        program_enable(
            Self::ID,
            node.policy.no_snoop,
            cap,
            node.bdf,
            io,
            DeviceControl::with_enable_no_snoop,
        )
    }

    fn committed(cap: &PcieCapability) -> Setting {
        cap.device_control.enable_no_snoop().into()
    }
}
