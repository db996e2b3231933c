// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The phase controller: resolves policy, runs every enabled feature over
//! each root port subtree, and notifies the platform of the result.

use crate::ROOT_PORT_LEVEL;
use crate::io::ConfigSpaceAccess;
use crate::policy::DevicePolicy;
use crate::policy::DeviceState;
use crate::policy::PlatformProtocol;
use crate::policy::PolicyError;
use crate::policy::PolicySource;
use crate::registry::FeatureConfig;
use crate::registry::FeatureError;
use crate::registry::FeatureFailure;
use crate::registry::FeatureSet;
use crate::registry::REGISTRY;
use crate::registry::committed_setting;
use crate::registry::implemented;
use crate::registry::run_feature;
use crate::topology::DeviceNode;
use crate::topology::PcieCapability;
use crate::topology::RootBridge;
use crate::topology::RootBridgeId;
use crate::walk::Order;
use crate::walk::walk;
use thiserror::Error;

/// Error preventing negotiation from starting.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// There is no platform policy source, so no feature is configured.
    #[error("no platform policy source available")]
    Unsupported,
    /// The platform policy source failed.
    #[error("failed to get the platform pcie feature policy")]
    PlatformPolicy(#[source] PolicyError),
}

/// Per-device failures of one negotiation run.
///
/// Failures never stop a run: the device is left as it was for the failing
/// feature, and every other device and feature is still processed.
#[derive(Debug, Default)]
pub struct NegotiationReport {
    /// Failures in the order they occurred.
    pub failures: Vec<FeatureFailure>,
}

impl NegotiationReport {
    /// Returns true if every feature was applied to every device.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A negotiation session: the set of features agreed with the platform,
/// applied to one or more root bridges.
#[derive(Debug, Clone)]
pub struct FeatureEngine {
    enabled: FeatureSet,
}

impl FeatureEngine {
    /// Agrees on the features to configure with the platform.
    ///
    /// The platform is offered the features enabled in `config`, and the
    /// session enables the ones it accepts. Features the platform asks for
    /// that were not offered stay disabled.
    pub fn negotiate(
        config: &FeatureConfig,
        source: Option<&mut (impl PolicySource + ?Sized)>,
    ) -> Result<Self, NegotiationError> {
        let source = source.ok_or(NegotiationError::Unsupported)?;
        let offered = config.offered();
        let requested = source
            .get_policy(offered)
            .map_err(NegotiationError::PlatformPolicy)?;

        let unsupported = requested.difference(offered);
        for id in unsupported.iter() {
            tracing::error!(feature = %id, "platform enabled an unsupported pcie feature");
        }

        let enabled = requested.intersection(offered);
        for id in enabled.iter() {
            tracing::info!(feature = %id, "pcie feature enabled");
        }
        Ok(Self { enabled })
    }

    /// A session with exactly the `enabled` features, bypassing the platform
    /// request.
    pub fn with_enabled(enabled: FeatureSet) -> Self {
        Self {
            enabled: enabled.intersection(implemented()),
        }
    }

    /// The features this session configures.
    pub fn enabled(&self) -> FeatureSet {
        self.enabled
    }

    /// Negotiates every PCI Express root port subtree below `root_bridge`.
    ///
    /// For each subtree the per-device policies are fetched from `platform`,
    /// each enabled feature is scanned and programmed in registry order, and
    /// the final state of every device is reported back to `platform`.
    pub fn configure_root_bridge(
        &self,
        root_bridge: &mut RootBridge,
        io: &mut dyn ConfigSpaceAccess,
        platform: &mut (impl PlatformProtocol + ?Sized),
    ) -> NegotiationReport {
        let mut report = NegotiationReport::default();
        if self.enabled.is_empty() {
            tracing::debug!(root_bridge = %root_bridge.id, "no pcie features enabled");
            return report;
        }

        let id = root_bridge.id;
        for root in root_bridge.children.iter_mut().filter(|node| node.is_pcie()) {
            tracing::info!(root_bridge = %id, bdf = %root.bdf, "negotiating pcie features");
            self.resolve_policies(id, root, platform);
            for feature in REGISTRY.into_iter().filter(|&f| self.enabled.contains(f)) {
                run_feature(feature, root, io, &mut report.failures);
            }
            self.notify(id, root, platform);
        }

        for failure in &report.failures {
            if let FeatureError::Io(err) = &failure.error {
                tracing::error!(
                    root_bridge = %id,
                    bdf = %failure.bdf,
                    feature = %failure.feature,
                    error = err as &dyn std::error::Error,
                    "failed to commit pcie feature"
                );
            }
        }
        report
    }

    fn resolve_policies(
        &self,
        id: RootBridgeId,
        root: &mut DeviceNode,
        source: &mut (impl PolicySource + ?Sized),
    ) {
        let template = DevicePolicy::template(self.enabled);
        walk(root, Order::PreOrder, ROOT_PORT_LEVEL, &mut |node, _| {
            let mut policy = template;
            match source.get_device_policy(id, node.bdf, &mut policy) {
                Ok(()) => {}
                Err(PolicyError::Unsupported) => policy = template,
                Err(err) => {
                    tracing::warn!(
                        bdf = %node.bdf,
                        error = &err as &dyn std::error::Error,
                        "failed to get device policy, using defaults"
                    );
                    policy = template;
                }
            }
            policy.formalize();
            policy.restrict(self.enabled);
            node.policy = policy;
            Ok(())
        });
    }

    fn notify(
        &self,
        id: RootBridgeId,
        root: &mut DeviceNode,
        sink: &mut (impl PlatformProtocol + ?Sized),
    ) {
        walk(root, Order::PreOrder, ROOT_PORT_LEVEL, &mut |node, _| {
            if let Some(cap) = &node.pcie {
                let state = self.committed_state(cap);
                if let Err(err) = sink.notify_device_state(id, node.bdf, &state) {
                    tracing::warn!(
                        bdf = %node.bdf,
                        error = &err as &dyn std::error::Error,
                        "failed to notify device state"
                    );
                }
            }
            Ok(())
        });
    }

    /// The committed register values of the enabled features of a device.
    pub fn committed_state(&self, cap: &PcieCapability) -> DeviceState {
        let mut state = DeviceState::not_applicable();
        for id in self.enabled.iter() {
            *state.get_mut(id) = committed_setting(id, cap);
        }
        state
    }
}

/// Negotiates the features of one root bridge end to end.
///
/// Without a platform there is no policy to apply, and the hardware is left
/// untouched.
pub fn enumerate_root_bridge_features(
    config: &FeatureConfig,
    root_bridge: &mut RootBridge,
    io: &mut dyn ConfigSpaceAccess,
    platform: Option<&mut (impl PlatformProtocol + ?Sized)>,
) -> Result<NegotiationReport, NegotiationError> {
    let platform = platform.ok_or(NegotiationError::Unsupported)?;
    let engine = FeatureEngine::negotiate(config, Some(&mut *platform))?;
    Ok(engine.configure_root_bridge(root_bridge, io, platform))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Setting;
    use crate::registry::FeatureId;
    use crate::test_helpers::TestConfigSpace;
    use crate::test_helpers::TestPlatform;
    use crate::test_helpers::TopologyBuilder;
    use crate::test_helpers::WarningCounter;
    use crate::test_helpers::capability;
    use crate::topology::Bdf;
    use pci_core::spec::caps::pci_express::DeviceCapabilities;
    use pci_core::spec::caps::pci_express::DeviceCapabilities2;
    use pci_core::spec::caps::pci_express::DeviceControl;
    use pci_core::spec::caps::pci_express::DevicePortType;
    use pci_core::spec::caps::pci_express::PayloadSize;
    use pci_core::spec::caps::pci_express::PciExpressCapabilityHeader;

    const RP: Bdf = Bdf::new(0, 1, 0);
    const USP: Bdf = Bdf::new(1, 0, 0);
    const DSP: Bdf = Bdf::new(2, 0, 0);
    const EP: Bdf = Bdf::new(3, 0, 0);
    const LEGACY: Bdf = Bdf::new(0, 2, 0);
    const ALL: [Bdf; 4] = [RP, USP, DSP, EP];

    /// Root bridge -> RP -> USP -> DSP -> EP, plus a conventional PCI
    /// function directly below the root bridge. The payload capabilities are
    /// 512, 256, 256 and 128 bytes, and every device is programmed to 4096.
    fn hierarchy() -> (RootBridge, TestConfigSpace) {
        let mut topo = TopologyBuilder::new();
        let mut device = |bdf, port_type, mps: PayloadSize| {
            topo.device_with(
                bdf,
                capability(port_type)
                    .with_device_capabilities(
                        DeviceCapabilities::new()
                            .with_max_payload_size(mps.0.into())
                            .with_ext_tag_field(true),
                    )
                    .with_device_capabilities_2(
                        DeviceCapabilities2::new()
                            .with_ltr_mechanism_supported(true)
                            .with_completion_timeout_ranges_supported(0b0010)
                            .with_atomic_op_routing_supported(port_type != DevicePortType::ENDPOINT),
                    )
                    .with_device_control(
                        DeviceControl::new()
                            .with_max_payload_size(PayloadSize::MAX.0.into())
                            .with_max_read_request_size(PayloadSize::MAX.0.into()),
                    ),
            )
        };
        let ep = device(EP, DevicePortType::ENDPOINT, PayloadSize::SIZE_128);
        let dsp = device(DSP, DevicePortType::DOWNSTREAM_SWITCH_PORT, PayloadSize::SIZE_256)
            .with_child(ep);
        let usp = device(USP, DevicePortType::UPSTREAM_SWITCH_PORT, PayloadSize::SIZE_256)
            .with_child(dsp);
        let rp = device(RP, DevicePortType::ROOT_PORT, PayloadSize::SIZE_512).with_child(usp);
        let bridge = RootBridge::new(0, 0)
            .with_child(rp)
            .with_child(DeviceNode::new(LEGACY, None));
        (bridge, topo.cfg)
    }

    fn cap(bridge: &RootBridge, bdf: Bdf) -> &PcieCapability {
        bridge.find(bdf).unwrap().pcie.as_ref().unwrap()
    }

    #[test]
    fn full_run_aligns_payload_and_read_request_size() {
        let (mut bridge, mut cfg) = hierarchy();
        let mut platform = TestPlatform::new();

        let report = enumerate_root_bridge_features(
            &FeatureConfig::all(),
            &mut bridge,
            &mut cfg,
            Some(&mut platform),
        )
        .unwrap();
        assert!(report.is_clean(), "{:?}", report.failures);

        for bdf in ALL {
            let ctl = cap(&bridge, bdf).device_control;
            assert_eq!(ctl.max_payload_size(), 0, "{bdf}");
            assert_eq!(ctl.max_read_request_size(), 0, "{bdf}");
            let hw = DeviceControl::from_bits(
                cfg.pcie_reg(bdf, PciExpressCapabilityHeader::DEVICE_CTL),
            );
            assert_eq!(hw, ctl, "{bdf}");
        }
        assert!(cfg.writes_to(LEGACY).is_empty());
        assert_eq!(cfg.exclusive_depth(), 0);
    }

    #[test]
    fn notification_reports_committed_registers() {
        let (mut bridge, mut cfg) = hierarchy();
        let mut platform = TestPlatform::new()
            .with_policy(EP, FeatureId::Ltr, Setting::Value(1))
            .with_policy(EP, FeatureId::RelaxedOrdering, Setting::Value(1));
        platform.requested = Some(
            FeatureSet::new()
                .with_max_payload_size(true)
                .with_ltr(true)
                .with_relaxed_ordering(true),
        );

        enumerate_root_bridge_features(
            &FeatureConfig::all(),
            &mut bridge,
            &mut cfg,
            Some(&mut platform),
        )
        .unwrap();

        let order: Vec<_> = platform.notifications.iter().map(|(bdf, _)| *bdf).collect();
        assert_eq!(order, ALL);

        let state = platform.notification(EP).unwrap();
        assert_eq!(state.max_payload_size, Setting::Value(0));
        assert_eq!(state.ltr, Setting::Value(1));
        assert_eq!(state.relaxed_ordering, Setting::Value(1));
        assert_eq!(state.max_read_request_size, Setting::NotApplicable);
        assert_eq!(state.completion_timeout, Setting::NotApplicable);

        // LTR propagated to every bridge above the endpoint.
        for bdf in ALL {
            assert_eq!(
                platform.notification(bdf).unwrap().ltr,
                Setting::Value(1),
                "{bdf}"
            );
        }
    }

    #[test]
    fn no_platform_leaves_hardware_untouched() {
        let (mut bridge, mut cfg) = hierarchy();
        let result = enumerate_root_bridge_features(
            &FeatureConfig::all(),
            &mut bridge,
            &mut cfg,
            None::<&mut TestPlatform>,
        );
        assert!(matches!(result, Err(NegotiationError::Unsupported)));
        assert!(cfg.writes().is_empty());
    }

    #[test]
    fn failed_platform_policy_is_reported() {
        let mut platform = TestPlatform::new();
        platform.fail_policy = true;
        let result = FeatureEngine::negotiate(&FeatureConfig::all(), Some(&mut platform));
        assert!(matches!(result, Err(NegotiationError::PlatformPolicy(_))));
    }

    #[test]
    fn platform_cannot_enable_unoffered_features() {
        let mut platform = TestPlatform::new();
        platform.requested = Some(
            FeatureSet::new()
                .with_max_payload_size(true)
                .with_ltr(true)
                .with_ptm(true),
        );
        let config = FeatureConfig::all().with_feature(FeatureId::Ltr, false);

        let engine = FeatureEngine::negotiate(&config, Some(&mut platform)).unwrap();
        assert_eq!(platform.offered, Some(config.offered()));
        assert_eq!(
            engine.enabled().iter().collect::<Vec<_>>(),
            [FeatureId::MaxPayloadSize]
        );
    }

    #[test]
    fn out_of_range_device_policy_is_not_applied() {
        let (mut bridge, mut cfg) = hierarchy();
        let mut platform =
            TestPlatform::new().with_policy_all(&ALL, FeatureId::NoSnoop, Setting::Value(7));
        platform.requested = Some(FeatureSet::new().with_no_snoop(true));

        let report = enumerate_root_bridge_features(
            &FeatureConfig::all(),
            &mut bridge,
            &mut cfg,
            Some(&mut platform),
        )
        .unwrap();
        assert!(report.is_clean());
        assert!(cfg.writes().is_empty());
        assert_eq!(
            bridge.find(EP).unwrap().policy.no_snoop,
            Setting::NotApplicable
        );
    }

    #[test]
    fn device_policy_error_falls_back_to_defaults() {
        let (mut bridge, mut cfg) = hierarchy();
        let mut platform = TestPlatform::new();
        platform.failing_devices.insert(USP);
        platform.requested = Some(FeatureSet::new().with_max_payload_size(true));

        let report = enumerate_root_bridge_features(
            &FeatureConfig::all(),
            &mut bridge,
            &mut cfg,
            Some(&mut platform),
        )
        .unwrap();
        assert!(report.is_clean());
        assert_eq!(
            bridge.find(USP).unwrap().policy.max_payload_size,
            Setting::Value(0)
        );
        assert_eq!(bridge.find(USP).unwrap().policy.ltr, Setting::NotApplicable);
    }

    #[test]
    fn io_failure_is_reported_and_walk_continues() {
        let (mut bridge, mut cfg) = hierarchy();
        cfg.fail_writes(USP);
        let mut platform = TestPlatform::new();
        platform.requested = Some(
            FeatureSet::new()
                .with_max_payload_size(true)
                .with_max_read_request_size(true),
        );

        let report = enumerate_root_bridge_features(
            &FeatureConfig::all(),
            &mut bridge,
            &mut cfg,
            Some(&mut platform),
        )
        .unwrap();

        let failed: Vec<_> = report
            .failures
            .iter()
            .map(|f| (f.bdf, f.feature))
            .collect();
        // MRRS follows the unchanged MPS of the failed device, so it needs
        // no write there.
        assert_eq!(failed, [(USP, FeatureId::MaxPayloadSize)]);
        assert!(matches!(report.failures[0].error, FeatureError::Io(_)));
        for bdf in [RP, DSP, EP] {
            assert_eq!(cap(&bridge, bdf).device_control.max_payload_size(), 0);
        }
        // The failed device keeps its old state.
        assert_eq!(
            cap(&bridge, USP).device_control.max_payload_size(),
            u16::from(PayloadSize::MAX.0)
        );
        assert_eq!(cfg.exclusive_depth(), 0);
    }

    #[test]
    fn rerun_is_idempotent() {
        let (mut bridge, mut cfg) = hierarchy();
        let mut platform = TestPlatform::new()
            .with_policy_all(&ALL, FeatureId::Ltr, Setting::Value(1))
            .with_policy_all(&ALL, FeatureId::CompletionTimeout, Setting::Value(0b0101))
            .with_policy_all(&ALL, FeatureId::AtomicOp, Setting::Value(0b11))
            .with_policy_all(&ALL, FeatureId::ExtendedTag, Setting::Value(0b01));
        let engine = FeatureEngine::negotiate(&FeatureConfig::all(), Some(&mut platform)).unwrap();

        let report = engine.configure_root_bridge(&mut bridge, &mut cfg, &mut platform);
        assert!(report.is_clean(), "{:?}", report.failures);
        assert!(!cfg.writes().is_empty());

        cfg.clear_writes();
        let report = engine.configure_root_bridge(&mut bridge, &mut cfg, &mut platform);
        assert!(report.is_clean());
        assert!(cfg.writes().is_empty());
    }

    #[test]
    fn notification_failures_are_ignored() {
        let (mut bridge, mut cfg) = hierarchy();
        let mut platform = TestPlatform::new();
        platform.fail_notifications = true;

        let report = enumerate_root_bridge_features(
            &FeatureConfig::all(),
            &mut bridge,
            &mut cfg,
            Some(&mut platform),
        )
        .unwrap();
        assert!(report.is_clean());
        assert_eq!(platform.notifications.len(), ALL.len());
    }

    #[test]
    fn root_port_subtrees_are_negotiated_independently() {
        const RP1: Bdf = Bdf::new(0, 1, 0);
        const EP1: Bdf = Bdf::new(1, 0, 0);
        const RP2: Bdf = Bdf::new(0, 2, 0);
        const EP2: Bdf = Bdf::new(2, 0, 0);

        let mut topo = TopologyBuilder::new();
        let mut device = |bdf, port_type, mps: PayloadSize, completer| {
            topo.device_with(
                bdf,
                capability(port_type)
                    .with_device_capabilities(
                        DeviceCapabilities::new().with_max_payload_size(mps.0.into()),
                    )
                    .with_device_capabilities_2(
                        DeviceCapabilities2::new()
                            .with_ten_bit_tag_completer_supported(completer)
                            .with_ten_bit_tag_requester_supported(true),
                    )
                    .with_device_control(
                        DeviceControl::new().with_max_payload_size(PayloadSize::MAX.0.into()),
                    ),
            )
        };
        let ep1 = device(EP1, DevicePortType::ENDPOINT, PayloadSize::SIZE_128, false);
        let rp1 = device(RP1, DevicePortType::ROOT_PORT, PayloadSize::SIZE_512, true);
        let ep2 = device(EP2, DevicePortType::ENDPOINT, PayloadSize::SIZE_512, false);
        let rp2 = device(RP2, DevicePortType::ROOT_PORT, PayloadSize::SIZE_1024, false);
        let mut bridge = RootBridge::new(0, 0)
            .with_child(rp1.with_child(ep1))
            .with_child(rp2.with_child(ep2));

        let mut platform = TestPlatform::new().with_policy_all(
            &[EP1, EP2],
            FeatureId::ExtendedTag,
            Setting::Value(0b10),
        );
        platform.requested = Some(
            FeatureSet::new()
                .with_max_payload_size(true)
                .with_extended_tag(true),
        );

        let report = enumerate_root_bridge_features(
            &FeatureConfig::all(),
            &mut bridge,
            &mut topo.cfg,
            Some(&mut platform),
        )
        .unwrap();
        assert!(report.is_clean(), "{:?}", report.failures);

        for (bdf, mps) in [
            (RP1, PayloadSize::SIZE_128),
            (EP1, PayloadSize::SIZE_128),
            (RP2, PayloadSize::SIZE_512),
            (EP2, PayloadSize::SIZE_512),
        ] {
            assert_eq!(
                cap(&bridge, bdf).device_control.max_payload_size(),
                u16::from(mps.0),
                "{bdf}"
            );
        }

        // Only the first root port completes 10-bit tags.
        assert!(cap(&bridge, EP1).device_control_2.ten_bit_tag_requester_enable());
        let ep2 = cap(&bridge, EP2);
        assert!(!ep2.device_control_2.ten_bit_tag_requester_enable());
        assert!(!ep2.device_control.extended_tag_enable());
    }

    #[test]
    fn commit_failure_is_logged_once() {
        let (mut bridge, mut cfg) = hierarchy();
        cfg.fail_writes(USP);
        let mut platform = TestPlatform::new();
        platform.requested = Some(FeatureSet::new().with_max_payload_size(true));
        let engine = FeatureEngine::negotiate(&FeatureConfig::all(), Some(&mut platform)).unwrap();

        let counter = WarningCounter::default();
        let _guard = counter.install();
        let report = engine.configure_root_bridge(&mut bridge, &mut cfg, &mut platform);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn explicit_feature_set_skips_platform_request() {
        let engine = FeatureEngine::with_enabled(FeatureSet::new().with_ltr(true).with_ptm(true));
        assert_eq!(engine.enabled().iter().collect::<Vec<_>>(), [FeatureId::Ltr]);

        let (mut bridge, mut cfg) = hierarchy();
        let mut platform = TestPlatform::new().with_policy(EP, FeatureId::Ltr, Setting::Value(1));
        let report = engine.configure_root_bridge(&mut bridge, &mut cfg, &mut platform);
        assert!(report.is_clean());
        assert_eq!(platform.offered, None);

        for bdf in ALL {
            let cap = cap(&bridge, bdf);
            assert!(cap.device_control_2.ltr_mechanism_enable(), "{bdf}");
            assert_eq!(
                cap.device_control.max_payload_size(),
                u16::from(PayloadSize::MAX.0),
                "{bdf}"
            );
        }
        assert_eq!(platform.notifications.len(), ALL.len());
    }

    #[test]
    fn nothing_enabled_does_nothing() {
        let (mut bridge, mut cfg) = hierarchy();
        let mut platform = TestPlatform::new();
        let engine = FeatureEngine::negotiate(&FeatureConfig::none(), Some(&mut platform)).unwrap();
        let report = engine.configure_root_bridge(&mut bridge, &mut cfg, &mut platform);
        assert!(report.is_clean());
        assert!(cfg.writes().is_empty());
        assert!(platform.notifications.is_empty());
    }
}
