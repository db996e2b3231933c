// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants specified by the PCI spec.
//!
//! This module MUST NOT contain any vendor-specific constants!

pub mod cfg_space {
    //! Configuration space header definitions.

    #![expect(missing_docs)] // constants/fields are self-explanatory

    use bitfield_struct::bitfield;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// Common configuration space header registers shared between Type 0 and
    /// Type 1 headers.
    ///
    /// | Offset | Bits 31-24     | Bits 23-16  | Bits 15-8   | Bits 7-0             |
    /// |--------|----------------|-------------|-------------|----------------------|
    /// | 0x0    | Device ID      |             | Vendor ID   |                      |
    /// | 0x4    | Status         |             | Command     |                      |
    /// | 0x8    | Class code     |             |             | Revision ID          |
    /// | 0x34   | Reserved       |             |             | Capabilities Pointer |
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct CommonHeader(pub u16);

    impl CommonHeader {
        pub const DEVICE_VENDOR: Self = Self(0x00);
        pub const COMMAND: Self = Self(0x04);
        pub const STATUS: Self = Self(0x06);
        pub const CLASS_REVISION: Self = Self(0x08);
        pub const RESERVED_CAP_PTR: Self = Self(0x34);
    }

    /// Size of the standard configuration space of a function.
    pub const CONFIG_SPACE_SIZE: u16 = 0x100;

    /// Size of the extended configuration space of a PCI Express function.
    pub const EXTENDED_CONFIG_SPACE_SIZE: u16 = 0x1000;

    /// Status Register
    #[bitfield(u16)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
    pub struct Status {
        #[bits(3)]
        _reserved: u16,
        pub interrupt_status: bool,
        pub capabilities_list: bool,
        pub capable_mhz_66: bool,
        _reserved2: bool,
        pub capable_fast_b2b: bool,
        pub err_master_parity: bool,
        #[bits(2)]
        pub devsel: u16,
        pub abort_target_signaled: bool,
        pub abort_target_received: bool,
        pub abort_master_received: bool,
        pub err_signaled: bool,
        pub err_detected_parity: bool,
    }
}

/// Capabilities
pub mod caps {
    /// Capability IDs
    ///
    /// Sources: PCI 2.3 Spec - Appendix H
    ///
    /// NOTE: this is a non-exhaustive list, so don't be afraid to add new
    /// variants on an as-needed basis!
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct CapabilityId(pub u8);

    #[expect(missing_docs)] // self explanatory variants
    impl CapabilityId {
        pub const MSI: Self = Self(0x05);
        pub const VENDOR_SPECIFIC: Self = Self(0x09);
        pub const PCI_EXPRESS: Self = Self(0x10);
        pub const MSIX: Self = Self(0x11);
    }

    /// PCI Express
    #[expect(missing_docs)] // primarily enums/structs with self-explanatory variants
    pub mod pci_express {
        use bitfield_struct::bitfield;
        use zerocopy::FromBytes;
        use zerocopy::Immutable;
        use zerocopy::IntoBytes;
        use zerocopy::KnownLayout;

        /// Offsets into the PCI Express Capability Header
        ///
        /// Table pulled from PCI Express Base Specification Rev. 3.0
        ///
        /// | Offset    | Bits 31-24       | Bits 23-16       | Bits 15-8        | Bits 7-0             |
        /// |-----------|------------------|----------------- |------------------|----------------------|
        /// | Cap + 0x0 | PCI Express Capabilities Register   | Next Pointer     | Capability ID (0x10) |
        /// | Cap + 0x4 | Device Capabilities Register                                                  |
        /// | Cap + 0x8 | Device Status    | Device Control                                             |
        /// | Cap + 0xC | Link Capabilities Register                                                    |
        /// | Cap + 0x10| Link Status      | Link Control                                               |
        /// | Cap + 0x24| Device Capabilities 2 Register                                                |
        /// | Cap + 0x28| Device Status 2  | Device Control 2                                           |
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct PciExpressCapabilityHeader(pub u16);

        impl PciExpressCapabilityHeader {
            pub const CAP_ID_NEXT: Self = Self(0x00);
            pub const PCIE_CAPS: Self = Self(0x02);
            pub const DEVICE_CAPS: Self = Self(0x04);
            pub const DEVICE_CTL: Self = Self(0x08);
            pub const DEVICE_STS: Self = Self(0x0A);
            pub const LINK_CAPS: Self = Self(0x0C);
            pub const LINK_CTL: Self = Self(0x10);
            pub const LINK_STS: Self = Self(0x12);
            pub const DEVICE_CAPS_2: Self = Self(0x24);
            pub const DEVICE_CTL_2: Self = Self(0x28);
        }

        /// Device/Port Type field of the PCI Express Capabilities Register.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct DevicePortType(pub u16);

        impl DevicePortType {
            pub const ENDPOINT: Self = Self(0b0000);
            pub const LEGACY_ENDPOINT: Self = Self(0b0001);
            pub const ROOT_PORT: Self = Self(0b0100);
            pub const UPSTREAM_SWITCH_PORT: Self = Self(0b0101);
            pub const DOWNSTREAM_SWITCH_PORT: Self = Self(0b0110);
            pub const PCIE_TO_PCI_BRIDGE: Self = Self(0b0111);
            pub const PCI_TO_PCIE_BRIDGE: Self = Self(0b1000);
            pub const ROOT_COMPLEX_INTEGRATED_ENDPOINT: Self = Self(0b1001);
            pub const ROOT_COMPLEX_EVENT_COLLECTOR: Self = Self(0b1010);

            pub const fn from_bits(bits: u16) -> Self {
                Self(bits)
            }

            pub const fn into_bits(self) -> u16 {
                self.0
            }

            /// Returns true for true endpoints, i.e. functions that originate
            /// requests at the bottom of a hierarchy.
            pub const fn is_endpoint(self) -> bool {
                matches!(self, Self::ENDPOINT | Self::LEGACY_ENDPOINT)
            }
        }

        /// Encodings of the Max_Payload_Size and Max_Read_Request_Size fields.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct PayloadSize(pub u8);

        impl PayloadSize {
            pub const SIZE_128: Self = Self(0);
            pub const SIZE_256: Self = Self(1);
            pub const SIZE_512: Self = Self(2);
            pub const SIZE_1024: Self = Self(3);
            pub const SIZE_2048: Self = Self(4);
            pub const SIZE_4096: Self = Self(5);

            /// Largest defined encoding. Larger values are reserved.
            pub const MAX: Self = Self::SIZE_4096;

            /// Returns the payload size in bytes, or `None` for reserved
            /// encodings.
            pub const fn bytes(self) -> Option<u32> {
                if self.0 <= Self::MAX.0 {
                    Some(128 << self.0)
                } else {
                    None
                }
            }
        }

        /// Bits of the Completion Timeout Ranges Supported field.
        pub mod completion_timeout_range {
            /// 50us to 10ms
            pub const A: u32 = 1 << 0;
            /// 10ms to 250ms
            pub const B: u32 = 1 << 1;
            /// 250ms to 4s
            pub const C: u32 = 1 << 2;
            /// 4s to 64s
            pub const D: u32 = 1 << 3;
        }

        /// Encodings of the ASPM Support and ASPM Control fields.
        pub mod aspm {
            pub const DISABLED: u8 = 0b00;
            pub const L0S: u8 = 0b01;
            pub const L1: u8 = 0b10;
            pub const L0S_L1: u8 = 0b11;
        }

        /// PCI Express Capabilities Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
        pub struct PciExpressCapabilities {
            #[bits(4)]
            pub capability_version: u16,
            #[bits(4)]
            pub device_port_type: DevicePortType,
            pub slot_implemented: bool,
            #[bits(5)]
            pub interrupt_message_number: u16,
            _undefined: bool,
            pub flit_mode_supported: bool,
        }

        /// Device Capabilities Register (From the 6.4 spec)
        #[bitfield(u32)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
        pub struct DeviceCapabilities {
            #[bits(3)]
            pub max_payload_size: u32,
            #[bits(2)]
            pub phantom_functions: u32,
            pub ext_tag_field: bool,
            #[bits(3)]
            pub endpoint_l0s_latency: u32,
            #[bits(3)]
            pub endpoint_l1_latency: u32,
            #[bits(3)]
            _reserved1: u32,
            pub role_based_error: bool,
            pub err_cor_subclass_capable: bool,
            pub rx_mps_fixed: bool,
            #[bits(8)]
            pub captured_slot_power_limit: u32,
            #[bits(2)]
            pub captured_slot_power_scale: u32,
            pub function_level_reset: bool,
            pub mixed_mps_supported: bool,
            pub tee_io_supported: bool,
            _reserved3: bool,
        }

        /// Device Control Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
        pub struct DeviceControl {
            pub correctable_error_reporting_enable: bool,
            pub non_fatal_error_reporting_enable: bool,
            pub fatal_error_reporting_enable: bool,
            pub unsupported_request_reporting_enable: bool,
            pub enable_relaxed_ordering: bool,
            #[bits(3)]
            pub max_payload_size: u16,
            pub extended_tag_enable: bool,
            pub phantom_functions_enable: bool,
            pub aux_power_pm_enable: bool,
            pub enable_no_snoop: bool,
            #[bits(3)]
            pub max_read_request_size: u16,
            pub initiate_function_level_reset: bool,
        }

        /// Link Capabilities Register
        #[bitfield(u32)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
        pub struct LinkCapabilities {
            #[bits(4)]
            pub max_link_speed: u32,
            #[bits(6)]
            pub max_link_width: u32,
            #[bits(2)]
            pub aspm_support: u32,
            #[bits(3)]
            pub l0s_exit_latency: u32,
            #[bits(3)]
            pub l1_exit_latency: u32,
            pub clock_power_management: bool,
            pub surprise_down_error_reporting: bool,
            pub data_link_layer_link_active_reporting: bool,
            pub link_bandwidth_notification_capability: bool,
            pub aspm_optionality_compliance: bool,
            #[bits(1)]
            _reserved: u32,
            #[bits(8)]
            pub port_number: u32,
        }

        /// Link Control Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
        pub struct LinkControl {
            #[bits(2)]
            pub aspm_control: u16,
            pub ptm_propagation_delay_adaptation_interpretation_b: bool,
            #[bits(1)]
            pub read_completion_boundary: u16,
            pub link_disable: bool,
            pub retrain_link: bool,
            pub common_clock_configuration: bool,
            pub extended_synch: bool,
            pub enable_clock_power_management: bool,
            pub hardware_autonomous_width_disable: bool,
            pub link_bandwidth_management_interrupt_enable: bool,
            pub link_autonomous_bandwidth_interrupt_enable: bool,
            #[bits(1)]
            pub sris_clocking: u16,
            pub flit_mode_disable: bool,
            #[bits(2)]
            pub drs_signaling_control: u16,
        }

        /// Link Status Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
        pub struct LinkStatus {
            #[bits(4)]
            pub current_link_speed: u16,
            #[bits(6)]
            pub negotiated_link_width: u16,
            #[bits(1)]
            _reserved: u16,
            pub link_training: bool,
            pub slot_clock_configuration: bool,
            pub data_link_layer_link_active: bool,
            pub link_bandwidth_management_status: bool,
            pub link_autonomous_bandwidth_status: bool,
        }

        /// Device Capabilities 2 Register
        #[bitfield(u32)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
        pub struct DeviceCapabilities2 {
            #[bits(4)]
            pub completion_timeout_ranges_supported: u32,
            pub completion_timeout_disable_supported: bool,
            pub ari_forwarding_supported: bool,
            pub atomic_op_routing_supported: bool,
            pub atomic_op_32_bit_completer_supported: bool,
            pub atomic_op_64_bit_completer_supported: bool,
            pub cas_128_bit_completer_supported: bool,
            pub no_ro_enabled_pr_pr_passing: bool,
            pub ltr_mechanism_supported: bool,
            #[bits(2)]
            pub tph_completer_supported: u32,
            #[bits(2)]
            _reserved1: u32,
            pub ten_bit_tag_completer_supported: bool,
            pub ten_bit_tag_requester_supported: bool,
            #[bits(2)]
            pub obff_supported: u32,
            pub extended_fmt_field_supported: bool,
            pub end_end_tlp_prefix_supported: bool,
            #[bits(2)]
            pub max_end_end_tlp_prefixes: u32,
            #[bits(2)]
            pub emergency_power_reduction_supported: u32,
            pub emergency_power_reduction_init_required: bool,
            #[bits(1)]
            _reserved2: u32,
            pub dmwr_completer_supported: bool,
            #[bits(2)]
            pub dmwr_lengths_supported: u32,
            pub frs_supported: bool,
        }

        /// Device Control 2 Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
        pub struct DeviceControl2 {
            #[bits(4)]
            pub completion_timeout_value: u16,
            pub completion_timeout_disable: bool,
            pub ari_forwarding_enable: bool,
            pub atomic_op_requester_enable: bool,
            pub atomic_op_egress_blocking: bool,
            pub ido_request_enable: bool,
            pub ido_completion_enable: bool,
            pub ltr_mechanism_enable: bool,
            pub emergency_power_reduction_request: bool,
            pub ten_bit_tag_requester_enable: bool,
            #[bits(2)]
            pub obff_enable: u16,
            pub end_end_tlp_prefix_blocking: bool,
        }
    }
}
