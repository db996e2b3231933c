// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Recursive traversal of the device tree.

use crate::registry::FeatureError;
use crate::topology::Bdf;
use crate::topology::DeviceNode;

/// When a node is visited relative to its children.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Order {
    /// Parent before children.
    PreOrder,
    /// Children before parent.
    PostOrder,
}

/// Visits `node` at `level` and every PCI Express capable function below it,
/// at increasing levels.
///
/// A failing callback does not stop the walk: every eligible node is visited,
/// and the failures are returned in visiting order.
pub fn walk<F>(
    node: &mut DeviceNode,
    order: Order,
    level: usize,
    callback: &mut F,
) -> Vec<(Bdf, FeatureError)>
where
    F: FnMut(&mut DeviceNode, usize) -> Result<(), FeatureError>,
{
    let mut failures = Vec::new();
    walk_inner(node, order, level, callback, &mut failures);
    failures
}

fn walk_inner<F>(
    node: &mut DeviceNode,
    order: Order,
    level: usize,
    callback: &mut F,
    failures: &mut Vec<(Bdf, FeatureError)>,
) where
    F: FnMut(&mut DeviceNode, usize) -> Result<(), FeatureError>,
{
    if order == Order::PreOrder {
        visit(node, level, callback, failures);
    }

    for child in node.children.iter_mut().filter(|child| child.is_pcie()) {
        walk_inner(child, order, level + 1, callback, failures);
    }

    if order == Order::PostOrder {
        visit(node, level, callback, failures);
    }
}

fn visit<F>(
    node: &mut DeviceNode,
    level: usize,
    callback: &mut F,
    failures: &mut Vec<(Bdf, FeatureError)>,
) where
    F: FnMut(&mut DeviceNode, usize) -> Result<(), FeatureError>,
{
    if let Err(err) = callback(node, level) {
        // Access failures are reported by whoever consumes the failure list.
        if !matches!(err, FeatureError::Io(_)) {
            tracing::warn!(
                bdf = %node.bdf,
                level,
                error = &err as &dyn std::error::Error,
                "device callback failed, continuing walk"
            );
        }
        failures.push((node.bdf, err));
    }
}
