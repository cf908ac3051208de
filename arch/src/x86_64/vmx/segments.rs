// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use hypervisor::arch::x86::gdt::SegmentDescriptor;
use hypervisor::arch::x86::regs::{SegmentRegister, SegmentSelector};
use hypervisor::arch::x86::vmx::{VmcsField, VmxResult};
use hypervisor::RegisterPort;

/// Guest segment access rights in the VMCS layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentAccessRights(pub u32);

impl SegmentAccessRights {
    const UNUSABLE: u32 = 1 << 16;

    /// Access rights of a segment register holding a null selector.
    pub fn unusable() -> Self {
        SegmentAccessRights(Self::UNUSABLE)
    }

    pub fn segment_type(&self) -> u8 {
        (self.0 & 0xf) as u8
    }

    pub fn is_code_or_data(&self) -> bool {
        self.0 & (1 << 4) != 0
    }

    pub fn dpl(&self) -> u8 {
        ((self.0 >> 5) & 0x3) as u8
    }

    pub fn present(&self) -> bool {
        self.0 & (1 << 7) != 0
    }

    pub fn avl(&self) -> bool {
        self.0 & (1 << 12) != 0
    }

    pub fn long(&self) -> bool {
        self.0 & (1 << 13) != 0
    }

    pub fn db(&self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn granularity(&self) -> bool {
        self.0 & (1 << 15) != 0
    }

    pub fn is_unusable(&self) -> bool {
        self.0 & Self::UNUSABLE != 0
    }
}

/// Builds the VMCS access-rights word of a usable segment from its
/// descriptor.
pub fn segment_access_rights(descriptor: &SegmentDescriptor) -> SegmentAccessRights {
    let mut raw = u32::from(descriptor.segment_type())
        | (u32::from(descriptor.is_code_or_data()) << 4)
        | (u32::from(descriptor.dpl()) << 5)
        | (u32::from(descriptor.present()) << 7);
    raw |= (u32::from(descriptor.avl()) << 12)
        | (u32::from(descriptor.long()) << 13)
        | (u32::from(descriptor.db()) << 14)
        | (u32::from(descriptor.granularity()) << 15);
    SegmentAccessRights(raw)
}

/// VMCS fields describing one segment register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentFields {
    pub guest_selector: VmcsField,
    pub guest_base: VmcsField,
    pub guest_limit: VmcsField,
    pub guest_access_rights: VmcsField,
    /// LDTR has no host-state selector.
    pub host_selector: Option<VmcsField>,
}

pub fn segment_fields(register: SegmentRegister) -> SegmentFields {
    use VmcsField::*;

    let (guest_selector, guest_base, guest_limit, guest_access_rights, host_selector) =
        match register {
            SegmentRegister::Es => (
                GuestEsSelector,
                GuestEsBase,
                GuestEsLimit,
                GuestEsAccessRights,
                Some(HostEsSelector),
            ),
            SegmentRegister::Cs => (
                GuestCsSelector,
                GuestCsBase,
                GuestCsLimit,
                GuestCsAccessRights,
                Some(HostCsSelector),
            ),
            SegmentRegister::Ss => (
                GuestSsSelector,
                GuestSsBase,
                GuestSsLimit,
                GuestSsAccessRights,
                Some(HostSsSelector),
            ),
            SegmentRegister::Ds => (
                GuestDsSelector,
                GuestDsBase,
                GuestDsLimit,
                GuestDsAccessRights,
                Some(HostDsSelector),
            ),
            SegmentRegister::Fs => (
                GuestFsSelector,
                GuestFsBase,
                GuestFsLimit,
                GuestFsAccessRights,
                Some(HostFsSelector),
            ),
            SegmentRegister::Gs => (
                GuestGsSelector,
                GuestGsBase,
                GuestGsLimit,
                GuestGsAccessRights,
                Some(HostGsSelector),
            ),
            SegmentRegister::Ldtr => (
                GuestLdtrSelector,
                GuestLdtrBase,
                GuestLdtrLimit,
                GuestLdtrAccessRights,
                None,
            ),
            SegmentRegister::Tr => (
                GuestTrSelector,
                GuestTrBase,
                GuestTrLimit,
                GuestTrAccessRights,
                Some(HostTrSelector),
            ),
        };

    SegmentFields {
        guest_selector,
        guest_base,
        guest_limit,
        guest_access_rights,
        host_selector,
    }
}

/// Writes the guest-state fields of `register` in the current VMCS.
///
/// Without a descriptor the register is marked unusable.
pub fn write_guest_segment<P: RegisterPort>(
    port: &mut P,
    register: SegmentRegister,
    selector: SegmentSelector,
    descriptor: Option<&SegmentDescriptor>,
) -> VmxResult<()> {
    let fields = segment_fields(register);
    port.vmwrite(fields.guest_selector, u64::from(selector.0))?;
    match descriptor {
        Some(descriptor) => {
            port.vmwrite(fields.guest_base, u64::from(descriptor.base()))?;
            port.vmwrite(fields.guest_limit, u64::from(descriptor.effective_limit()))?;
            port.vmwrite(
                fields.guest_access_rights,
                u64::from(segment_access_rights(descriptor).0),
            )
        }
        None => port.vmwrite(
            fields.guest_access_rights,
            u64::from(SegmentAccessRights::unusable().0),
        ),
    }
}
