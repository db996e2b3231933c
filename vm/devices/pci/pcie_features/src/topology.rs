// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device tree walked by the engine, and the PCI Express capability
//! snapshot held for every function in it.

use crate::io::ConfigSpaceAccess;
use crate::io::ConfigSpaceError;
use crate::io::ExclusiveAccess;
use crate::policy::DevicePolicy;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::caps::pci_express::DeviceCapabilities;
use pci_core::spec::caps::pci_express::DeviceCapabilities2;
use pci_core::spec::caps::pci_express::DeviceControl;
use pci_core::spec::caps::pci_express::DeviceControl2;
use pci_core::spec::caps::pci_express::DevicePortType;
use pci_core::spec::caps::pci_express::LinkCapabilities;
use pci_core::spec::caps::pci_express::LinkControl;
use pci_core::spec::caps::pci_express::LinkStatus;
use pci_core::spec::caps::pci_express::PciExpressCapabilities;
use pci_core::spec::caps::pci_express::PciExpressCapabilityHeader;
use pci_core::spec::cfg_space::CommonHeader;
use pci_core::spec::cfg_space::Status;
use std::fmt;

const BDF_BUS_SHIFT: u16 = 8;
const BDF_DEVICE_SHIFT: u16 = 3;
const BDF_FUNCTION_MASK: u16 = 0x7;
const BDF_DEVICE_MASK: u16 = 0x1F;

/// First byte past the standard configuration header, where capabilities
/// may start.
const CAPABILITIES_START: u8 = 0x40;
/// A standard capability list cannot hold more entries than fit between
/// `CAPABILITIES_START` and the end of the 256-byte configuration space.
const MAX_CAPABILITIES: usize = 48;

/// Bus/device/function address of a PCI function.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bdf {
    /// Bus number.
    pub bus: u8,
    /// Device number, 0..=31.
    pub device: u8,
    /// Function number, 0..=7.
    pub function: u8,
}

impl Bdf {
    /// Builds an address from its parts.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Decodes a 16-bit routing ID.
    pub const fn from_routing_id(id: u16) -> Self {
        Self {
            bus: (id >> BDF_BUS_SHIFT) as u8,
            device: ((id >> BDF_DEVICE_SHIFT) & BDF_DEVICE_MASK) as u8,
            function: (id & BDF_FUNCTION_MASK) as u8,
        }
    }

    /// Encodes the address as a 16-bit routing ID.
    pub const fn routing_id(&self) -> u16 {
        ((self.bus as u16) << BDF_BUS_SHIFT)
            | (((self.device as u16) & BDF_DEVICE_MASK) << BDF_DEVICE_SHIFT)
            | ((self.function as u16) & BDF_FUNCTION_MASK)
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Snapshot of the PCI Express capability of one function.
///
/// The capability registers are read once before negotiation starts. The
/// control registers are mirrors: the engine decides whether a register needs
/// to change by looking at the mirror, and refreshes the mirror whenever it
/// commits a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcieCapability {
    /// Offset of the capability in configuration space.
    pub offset: u16,
    /// PCI Express Capabilities register.
    pub capabilities: PciExpressCapabilities,
    /// Device Capabilities register.
    pub device_capabilities: DeviceCapabilities,
    /// Device Capabilities 2 register.
    pub device_capabilities_2: DeviceCapabilities2,
    /// Link Capabilities register.
    pub link_capabilities: LinkCapabilities,
    /// Link Status register, at the time of the snapshot.
    pub link_status: LinkStatus,
    /// Device Control register mirror.
    pub device_control: DeviceControl,
    /// Device Control 2 register mirror.
    pub device_control_2: DeviceControl2,
    /// Link Control register mirror.
    pub link_control: LinkControl,
}

impl PcieCapability {
    /// Returns a snapshot of a capability at `offset` with every register
    /// cleared.
    pub fn new(offset: u16) -> Self {
        Self {
            offset,
            capabilities: PciExpressCapabilities::new(),
            device_capabilities: DeviceCapabilities::new(),
            device_capabilities_2: DeviceCapabilities2::new(),
            link_capabilities: LinkCapabilities::new(),
            link_status: LinkStatus::new(),
            device_control: DeviceControl::new(),
            device_control_2: DeviceControl2::new(),
            link_control: LinkControl::new(),
        }
    }

    /// Sets the device/port type.
    pub fn with_port_type(mut self, port_type: DevicePortType) -> Self {
        self.capabilities = self.capabilities.with_device_port_type(port_type);
        self
    }

    /// Sets the Device Capabilities register.
    pub fn with_device_capabilities(mut self, caps: DeviceCapabilities) -> Self {
        self.device_capabilities = caps;
        self
    }

    /// Sets the Device Capabilities 2 register.
    pub fn with_device_capabilities_2(mut self, caps: DeviceCapabilities2) -> Self {
        self.device_capabilities_2 = caps;
        self
    }

    /// Sets the Link Capabilities register.
    pub fn with_link_capabilities(mut self, caps: LinkCapabilities) -> Self {
        self.link_capabilities = caps;
        self
    }

    /// Sets the Link Status register.
    pub fn with_link_status(mut self, status: LinkStatus) -> Self {
        self.link_status = status;
        self
    }

    /// Sets the Device Control register mirror.
    pub fn with_device_control(mut self, ctl: DeviceControl) -> Self {
        self.device_control = ctl;
        self
    }

    /// Sets the Device Control 2 register mirror.
    pub fn with_device_control_2(mut self, ctl: DeviceControl2) -> Self {
        self.device_control_2 = ctl;
        self
    }

    /// Sets the Link Control register mirror.
    pub fn with_link_control(mut self, ctl: LinkControl) -> Self {
        self.link_control = ctl;
        self
    }

    /// The device/port type of the function.
    pub fn port_type(&self) -> DevicePortType {
        self.capabilities.device_port_type()
    }

    /// Reads a snapshot of the capability located at `offset`.
    pub fn read_from(
        io: &mut (impl ConfigSpaceAccess + ?Sized),
        bdf: Bdf,
        offset: u16,
    ) -> Result<Self, ConfigSpaceError> {
        let reg = |r: PciExpressCapabilityHeader| offset + r.0;
        Ok(Self {
            offset,
            capabilities: PciExpressCapabilities::from_bits(
                io.read_u16(bdf, reg(PciExpressCapabilityHeader::PCIE_CAPS))?,
            ),
            device_capabilities: DeviceCapabilities::from_bits(
                io.read_u32(bdf, reg(PciExpressCapabilityHeader::DEVICE_CAPS))?,
            ),
            device_capabilities_2: DeviceCapabilities2::from_bits(
                io.read_u32(bdf, reg(PciExpressCapabilityHeader::DEVICE_CAPS_2))?,
            ),
            link_capabilities: LinkCapabilities::from_bits(
                io.read_u32(bdf, reg(PciExpressCapabilityHeader::LINK_CAPS))?,
            ),
            link_status: LinkStatus::from_bits(
                io.read_u16(bdf, reg(PciExpressCapabilityHeader::LINK_STS))?,
            ),
            device_control: DeviceControl::from_bits(
                io.read_u16(bdf, reg(PciExpressCapabilityHeader::DEVICE_CTL))?,
            ),
            device_control_2: DeviceControl2::from_bits(
                io.read_u16(bdf, reg(PciExpressCapabilityHeader::DEVICE_CTL_2))?,
            ),
            link_control: LinkControl::from_bits(
                io.read_u16(bdf, reg(PciExpressCapabilityHeader::LINK_CTL))?,
            ),
        })
    }

    /// Walks the capability list of `bdf` looking for the PCI Express
    /// capability, returning its offset.
    pub fn locate(
        io: &mut (impl ConfigSpaceAccess + ?Sized),
        bdf: Bdf,
    ) -> Result<Option<u16>, ConfigSpaceError> {
        let status = Status::from_bits(io.read_u16(bdf, CommonHeader::STATUS.0)?);
        if !status.capabilities_list() {
            return Ok(None);
        }

        let mut ptr = io.read_u8(bdf, CommonHeader::RESERVED_CAP_PTR.0)? & !0b11;
        for _ in 0..MAX_CAPABILITIES {
            if ptr < CAPABILITIES_START {
                break;
            }
            let header = io.read_u16(bdf, ptr.into())?;
            if CapabilityId(header as u8) == CapabilityId::PCI_EXPRESS {
                return Ok(Some(ptr.into()));
            }
            ptr = (header >> 8) as u8 & !0b11;
        }
        Ok(None)
    }

    /// Locates and reads the PCI Express capability of `bdf`, if it has one.
    pub fn probe(
        io: &mut (impl ConfigSpaceAccess + ?Sized),
        bdf: Bdf,
    ) -> Result<Option<Self>, ConfigSpaceError> {
        match Self::locate(io, bdf)? {
            Some(offset) => Self::read_from(io, bdf, offset).map(Some),
            None => Ok(None),
        }
    }

    /// Applies `update` to the Device Control register.
    ///
    /// Nothing is accessed if `update` leaves the mirror unchanged. Otherwise
    /// the live register is read, updated and written back inside an
    /// exclusive section, and the mirror is refreshed. Returns whether a
    /// write happened.
    pub(crate) fn update_device_control(
        &mut self,
        io: &mut dyn ConfigSpaceAccess,
        bdf: Bdf,
        update: impl Fn(DeviceControl) -> DeviceControl,
    ) -> Result<bool, ConfigSpaceError> {
        commit(
            io,
            bdf,
            self.offset + PciExpressCapabilityHeader::DEVICE_CTL.0,
            &mut self.device_control,
            DeviceControl::from_bits,
            DeviceControl::into_bits,
            update,
        )
    }

    /// Applies `update` to the Device Control 2 register. See
    /// [`Self::update_device_control`].
    pub(crate) fn update_device_control_2(
        &mut self,
        io: &mut dyn ConfigSpaceAccess,
        bdf: Bdf,
        update: impl Fn(DeviceControl2) -> DeviceControl2,
    ) -> Result<bool, ConfigSpaceError> {
        commit(
            io,
            bdf,
            self.offset + PciExpressCapabilityHeader::DEVICE_CTL_2.0,
            &mut self.device_control_2,
            DeviceControl2::from_bits,
            DeviceControl2::into_bits,
            update,
        )
    }

    /// Applies `update` to the Link Control register. See
    /// [`Self::update_device_control`].
    pub(crate) fn update_link_control(
        &mut self,
        io: &mut dyn ConfigSpaceAccess,
        bdf: Bdf,
        update: impl Fn(LinkControl) -> LinkControl,
    ) -> Result<bool, ConfigSpaceError> {
        commit(
            io,
            bdf,
            self.offset + PciExpressCapabilityHeader::LINK_CTL.0,
            &mut self.link_control,
            LinkControl::from_bits,
            LinkControl::into_bits,
            update,
        )
    }
}

fn commit<R: Copy + PartialEq>(
    io: &mut dyn ConfigSpaceAccess,
    bdf: Bdf,
    offset: u16,
    mirror: &mut R,
    from_bits: fn(u16) -> R,
    into_bits: fn(R) -> u16,
    update: impl Fn(R) -> R,
) -> Result<bool, ConfigSpaceError> {
    if update(*mirror) == *mirror {
        return Ok(false);
    }

    let mut io = ExclusiveAccess::new(io);
    let value = update(from_bits(io.read_u16(bdf, offset)?));
    io.write_u16(bdf, offset, into_bits(value))?;
    *mirror = value;
    Ok(true)
}

/// One function in the device tree.
#[derive(Debug, Clone)]
pub struct DeviceNode {
    /// Address of the function.
    pub bdf: Bdf,
    /// PCI Express capability snapshot. Functions without one are skipped by
    /// every walk.
    pub pcie: Option<PcieCapability>,
    /// The policy resolved for this function.
    pub policy: DevicePolicy,
    /// Functions on the secondary side of this one, if it is a bridge.
    pub children: Vec<DeviceNode>,
}

impl DeviceNode {
    /// Creates a node with no children and an untouched policy.
    pub fn new(bdf: Bdf, pcie: Option<PcieCapability>) -> Self {
        Self {
            bdf,
            pcie,
            policy: DevicePolicy::not_applicable(),
            children: Vec::new(),
        }
    }

    /// Creates a node for `bdf`, reading its PCI Express capability (if any)
    /// through `io`.
    pub fn probe(
        io: &mut (impl ConfigSpaceAccess + ?Sized),
        bdf: Bdf,
    ) -> Result<Self, ConfigSpaceError> {
        Ok(Self::new(bdf, PcieCapability::probe(io, bdf)?))
    }

    /// Adds `child` below this node.
    pub fn with_child(mut self, child: DeviceNode) -> Self {
        self.children.push(child);
        self
    }

    /// Returns true if the function has a PCI Express capability.
    pub fn is_pcie(&self) -> bool {
        self.pcie.is_some()
    }

    /// Finds the node for `bdf` in this subtree.
    pub fn find(&self, bdf: Bdf) -> Option<&DeviceNode> {
        if self.bdf == bdf {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(bdf))
    }
}

/// Identifies a root bridge to the platform.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RootBridgeId {
    /// PCI segment group.
    pub segment: u16,
    /// First bus number decoded by the root bridge.
    pub bus: u8,
}

impl fmt::Display for RootBridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:02x}", self.segment, self.bus)
    }
}

/// A host/root bridge and the functions directly below it. The bridge itself
/// is never programmed.
#[derive(Debug, Clone)]
pub struct RootBridge {
    /// Identity of the bridge.
    pub id: RootBridgeId,
    /// Functions directly below the bridge, typically root ports and root
    /// complex integrated endpoints.
    pub children: Vec<DeviceNode>,
}

impl RootBridge {
    /// Creates a root bridge with no children.
    pub fn new(segment: u16, bus: u8) -> Self {
        Self {
            id: RootBridgeId { segment, bus },
            children: Vec::new(),
        }
    }

    /// Adds `child` directly below the bridge.
    pub fn with_child(mut self, child: DeviceNode) -> Self {
        self.children.push(child);
        self
    }

    /// Finds the node for `bdf` anywhere below the bridge.
    pub fn find(&self, bdf: Bdf) -> Option<&DeviceNode> {
        self.children.iter().find_map(|child| child.find(bdf))
    }
}
