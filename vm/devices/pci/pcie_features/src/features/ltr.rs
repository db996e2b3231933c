// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Latency Tolerance Reporting.
//!
//! A bridge has to enable LTR if any function below it does, since LTR
//! messages are relayed through it, and a bridge that cannot or must not
//! enable LTR rules it out for its whole subtree. The scan resolves this
//! bottom-up with one aggregation slot per level; the program then writes
//! parents before children.

use crate::MAX_HIERARCHY_DEPTH;
use crate::io::ConfigSpaceAccess;
use crate::policy::Setting;
use crate::registry::FeatureError;
use crate::registry::FeatureId;
use crate::registry::PcieFeature;
use crate::topology::DeviceNode;
use crate::topology::PcieCapability;
use crate::walk::Order;

pub(crate) struct Ltr;

/// OR of the resolved LTR enables of the functions visited at each level of
/// the subtree currently being resolved.
pub(crate) struct LtrContext {
    slots: Vec<Option<bool>>,
}

impl Default for LtrContext {
    fn default() -> Self {
        Self {
            slots: vec![None; MAX_HIERARCHY_DEPTH + 2],
        }
    }
}

fn force_disable(node: &mut DeviceNode) {
    node.policy.ltr = Setting::Value(0);
    for child in &mut node.children {
        force_disable(child);
    }
}

impl PcieFeature for Ltr {
    const ID: FeatureId = FeatureId::Ltr;
    const SCAN_ORDER: Option<Order> = Some(Order::PostOrder);
    const PROGRAM_ORDER: Order = Order::PreOrder;

    type Context = LtrContext;

    fn scan(
        ctx: &mut LtrContext,
        node: &mut DeviceNode,
        level: usize,
    ) -> Result<(), FeatureError> {
        let Some(cap) = &node.pcie else {
            return Ok(());
        };
        if level + 1 >= ctx.slots.len() {
            return Err(Self::invalid(0, "hierarchy too deep"));
        }

        let children = ctx.slots[level + 1].take();
        let resolved = if !cap.device_capabilities_2.ltr_mechanism_supported()
            || node.policy.ltr == Setting::Value(0)
        {
            tracing::debug!(bdf = %node.bdf, "ltr disabled for subtree");
            force_disable(node);
            Some(false)
        } else {
            match (node.policy.ltr, children) {
                (Setting::Value(v), _) => Some(v != 0),
                (Setting::Auto | Setting::NotApplicable, Some(children)) => {
                    node.policy.ltr = children.into();
                    Some(children)
                }
                (Setting::Auto | Setting::NotApplicable, None) => None,
            }
        };

        if let Some(enable) = resolved {
            let slot = &mut ctx.slots[level];
            *slot = Some(slot.unwrap_or(false) || enable);
        }
        Ok(())
    }

    fn program(
        _ctx: &mut LtrContext,
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
        let Setting::Value(v) = policy.ltr else {
            return Ok(());
        };

        let enable = v != 0;
        if cap.update_device_control_2(io, *bdf, |ctl| ctl.with_ltr_mechanism_enable(enable))? {
            tracing::debug!(bdf = %bdf, enable, "programmed ltr mechanism enable");
        }
        Ok(())
    }

    fn committed(cap: &PcieCapability) -> Setting {
        cap.device_control_2.ltr_mechanism_enable().into()
    }
}
