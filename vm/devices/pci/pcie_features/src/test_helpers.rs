// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::io::ConfigSpaceAccess;
use crate::io::ConfigSpaceError;
use crate::policy::DevicePolicy;
use crate::policy::DeviceState;
use crate::policy::NotificationSink;
use crate::policy::PolicyError;
use crate::policy::PolicySource;
use crate::policy::Setting;
use crate::registry::FeatureId;
use crate::registry::FeatureSet;
use crate::topology::Bdf;
use crate::topology::DeviceNode;
use crate::topology::PcieCapability;
use crate::topology::RootBridgeId;
use pci_core::spec::caps::pci_express::DevicePortType;
use pci_core::spec::caps::pci_express::PciExpressCapabilityHeader;
use pci_core::spec::cfg_space::EXTENDED_CONFIG_SPACE_SIZE;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

pub const CAP_OFFSET: u16 = 0x40;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A tracing layer counting events at `WARN` or above.
#[derive(Clone, Default)]
pub struct WarningCounter(Arc<AtomicUsize>);

impl WarningCounter {
    /// Routes this thread's events to the counter until the guard is dropped.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        use tracing_subscriber::layer::SubscriberExt;
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCounter {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if *event.metadata().level() <= tracing::Level::WARN {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A write issued through [`TestConfigSpace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Write {
    pub bdf: Bdf,
    pub offset: u16,
    pub value: u16,
}

/// In-memory configuration space for any number of functions.
#[derive(Default)]
pub struct TestConfigSpace {
    functions: HashMap<Bdf, Vec<u8>>,
    writes: Vec<Write>,
    failing_reads: HashSet<Bdf>,
    failing_writes: HashSet<Bdf>,
    exclusive_depth: usize,
    exclusive_sections: usize,
}

impl TestConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn function(&mut self, bdf: Bdf) -> &mut Vec<u8> {
        self.functions
            .entry(bdf)
            .or_insert_with(|| vec![0; EXTENDED_CONFIG_SPACE_SIZE.into()])
    }

    pub fn set_u16(&mut self, bdf: Bdf, offset: u16, value: u16) {
        let offset = offset as usize;
        self.function(bdf)[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_u32(&mut self, bdf: Bdf, offset: u16, value: u32) {
        let offset = offset as usize;
        self.function(bdf)[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn get_u16(&mut self, bdf: Bdf, offset: u16) -> u16 {
        let offset = offset as usize;
        let bytes = &self.function(bdf)[offset..offset + 2];
        u16::from_le_bytes([bytes[0], bytes[1]])
    }

    pub fn get_u32(&mut self, bdf: Bdf, offset: u16) -> u32 {
        let offset = offset as usize;
        let bytes = &self.function(bdf)[offset..offset + 4];
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Reads a register of the PCI Express capability installed by
    /// [`install_capability`].
    pub fn pcie_reg(&mut self, bdf: Bdf, reg: PciExpressCapabilityHeader) -> u16 {
        self.get_u16(bdf, CAP_OFFSET + reg.0)
    }

    pub fn fail_reads(&mut self, bdf: Bdf) {
        self.failing_reads.insert(bdf);
    }

    pub fn fail_writes(&mut self, bdf: Bdf) {
        self.failing_writes.insert(bdf);
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn writes_to(&self, bdf: Bdf) -> Vec<Write> {
        self.writes.iter().filter(|w| w.bdf == bdf).copied().collect()
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    pub fn exclusive_depth(&self) -> usize {
        self.exclusive_depth
    }

    pub fn exclusive_sections(&self) -> usize {
        self.exclusive_sections
    }
}

impl ConfigSpaceAccess for TestConfigSpace {
    fn read_u16(&mut self, bdf: Bdf, offset: u16) -> Result<u16, ConfigSpaceError> {
        if self.failing_reads.contains(&bdf) {
            return Err(ConfigSpaceError::Read { bdf, offset });
        }
        Ok(self.get_u16(bdf, offset))
    }

    fn read_u32(&mut self, bdf: Bdf, offset: u16) -> Result<u32, ConfigSpaceError> {
        if self.failing_reads.contains(&bdf) {
            return Err(ConfigSpaceError::Read { bdf, offset });
        }
        Ok(self.get_u32(bdf, offset))
    }

    fn write_u16(&mut self, bdf: Bdf, offset: u16, value: u16) -> Result<(), ConfigSpaceError> {
        if self.failing_writes.contains(&bdf) {
            return Err(ConfigSpaceError::Write { bdf, offset });
        }
        self.writes.push(Write { bdf, offset, value });
        self.set_u16(bdf, offset, value);
        Ok(())
    }

    fn enter_exclusive(&mut self) {
        assert_eq!(self.exclusive_depth, 0, "exclusive sections must not nest");
        self.exclusive_depth += 1;
        self.exclusive_sections += 1;
    }

    fn exit_exclusive(&mut self) {
        self.exclusive_depth -= 1;
    }
}

/// Lays `cap` out in the configuration space of `bdf` as the only entry of
/// its capability list.
pub fn install_capability(cfg: &mut TestConfigSpace, bdf: Bdf, cap: &PcieCapability) {
    let reg = |r: PciExpressCapabilityHeader| cap.offset + r.0;
    // Status: capabilities list.
    cfg.set_u16(bdf, 0x06, 1 << 4);
    cfg.set_u16(bdf, 0x34, cap.offset);
    cfg.set_u16(bdf, reg(PciExpressCapabilityHeader::CAP_ID_NEXT), 0x0010);
    cfg.set_u16(
        bdf,
        reg(PciExpressCapabilityHeader::PCIE_CAPS),
        cap.capabilities.into_bits(),
    );
    cfg.set_u32(
        bdf,
        reg(PciExpressCapabilityHeader::DEVICE_CAPS),
        cap.device_capabilities.into_bits(),
    );
    cfg.set_u16(
        bdf,
        reg(PciExpressCapabilityHeader::DEVICE_CTL),
        cap.device_control.into_bits(),
    );
    cfg.set_u32(
        bdf,
        reg(PciExpressCapabilityHeader::LINK_CAPS),
        cap.link_capabilities.into_bits(),
    );
    cfg.set_u16(
        bdf,
        reg(PciExpressCapabilityHeader::LINK_CTL),
        cap.link_control.into_bits(),
    );
    cfg.set_u16(
        bdf,
        reg(PciExpressCapabilityHeader::LINK_STS),
        cap.link_status.into_bits(),
    );
    cfg.set_u32(
        bdf,
        reg(PciExpressCapabilityHeader::DEVICE_CAPS_2),
        cap.device_capabilities_2.into_bits(),
    );
    cfg.set_u16(
        bdf,
        reg(PciExpressCapabilityHeader::DEVICE_CTL_2),
        cap.device_control_2.into_bits(),
    );
}

/// A capability snapshot at [`CAP_OFFSET`] with every register cleared.
pub fn capability(port_type: DevicePortType) -> PcieCapability {
    PcieCapability::new(CAP_OFFSET).with_port_type(port_type)
}

/// Builds device nodes whose registers are mirrored into a
/// [`TestConfigSpace`].
pub struct TopologyBuilder {
    pub cfg: TestConfigSpace,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        init_tracing();
        Self {
            cfg: TestConfigSpace::new(),
        }
    }

    pub fn device(&mut self, bdf: Bdf, port_type: DevicePortType) -> DeviceNode {
        self.device_with(bdf, capability(port_type))
    }

    pub fn device_with(&mut self, bdf: Bdf, cap: PcieCapability) -> DeviceNode {
        install_capability(&mut self.cfg, bdf, &cap);
        DeviceNode::new(bdf, Some(cap))
    }
}

/// Scripted platform policy source and notification sink.
#[derive(Default)]
pub struct TestPlatform {
    /// Features the platform asks for. `None` accepts everything offered.
    pub requested: Option<FeatureSet>,
    /// Fail the initial policy request.
    pub fail_policy: bool,
    /// Features offered by the last policy request.
    pub offered: Option<FeatureSet>,
    /// Per-device overrides. Devices without an entry get `Unsupported`.
    pub device_policies: HashMap<Bdf, Vec<(FeatureId, Setting)>>,
    /// Devices whose policy request fails.
    pub failing_devices: HashSet<Bdf>,
    /// Fail every notification.
    pub fail_notifications: bool,
    pub notifications: Vec<(Bdf, DeviceState)>,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, bdf: Bdf, id: FeatureId, setting: Setting) -> Self {
        self.device_policies
            .entry(bdf)
            .or_default()
            .push((id, setting));
        self
    }

    /// Applies `setting` for `id` to every device in `bdfs`.
    pub fn with_policy_all(mut self, bdfs: &[Bdf], id: FeatureId, setting: Setting) -> Self {
        for &bdf in bdfs {
            self = self.with_policy(bdf, id, setting);
        }
        self
    }

    pub fn notification(&self, bdf: Bdf) -> Option<&DeviceState> {
        self.notifications
            .iter()
            .find(|(b, _)| *b == bdf)
            .map(|(_, state)| state)
    }
}

impl PolicySource for TestPlatform {
    fn get_policy(&mut self, supported: FeatureSet) -> Result<FeatureSet, PolicyError> {
        self.offered = Some(supported);
        if self.fail_policy {
            return Err(PolicyError::Platform("scripted failure".into()));
        }
        Ok(self.requested.unwrap_or(supported))
    }

    fn get_device_policy(
        &mut self,
        _root_bridge: RootBridgeId,
        bdf: Bdf,
        policy: &mut DevicePolicy,
    ) -> Result<(), PolicyError> {
        if self.failing_devices.contains(&bdf) {
            // Scribble over the policy to check that it is discarded.
            *policy = DevicePolicy::uniform(Setting::Value(0));
            return Err(PolicyError::InvalidParameter);
        }
        let overrides = self
            .device_policies
            .get(&bdf)
            .ok_or(PolicyError::Unsupported)?;
        for &(id, setting) in overrides {
            *policy.get_mut(id) = setting;
        }
        Ok(())
    }
}

impl NotificationSink for TestPlatform {
    fn notify_device_state(
        &mut self,
        _root_bridge: RootBridgeId,
        bdf: Bdf,
        state: &DeviceState,
    ) -> Result<(), PolicyError> {
        self.notifications.push((bdf, *state));
        if self.fail_notifications {
            return Err(PolicyError::Platform("scripted failure".into()));
        }
        Ok(())
    }
}
