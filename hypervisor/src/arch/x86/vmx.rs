// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! VMX instruction vocabulary: VMCS field encodings, instruction outcomes,
//! VM-instruction error numbers and TLB invalidation descriptors.

use thiserror::Error;

use crate::arch::x86::regs::{CF, ZF};

macro_rules! vmcs_fields {
    ($($(#[$attr:meta])* $name:ident = $encoding:literal,)*) => {
        /// VMCS component encodings accepted by `vmread` and `vmwrite`.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum VmcsField {
            $($(#[$attr])* $name = $encoding,)*
        }

        impl VmcsField {
            pub fn from_encoding(encoding: u32) -> Option<Self> {
                match encoding {
                    $($encoding => Some(VmcsField::$name),)*
                    _ => None,
                }
            }
        }
    };
}

vmcs_fields! {
    // 16-bit control fields
    VirtualProcessorId = 0x0000,
    PostedInterruptNotificationVector = 0x0002,
    EptpIndex = 0x0004,

    // 16-bit guest-state fields
    GuestEsSelector = 0x0800,
    GuestCsSelector = 0x0802,
    GuestSsSelector = 0x0804,
    GuestDsSelector = 0x0806,
    GuestFsSelector = 0x0808,
    GuestGsSelector = 0x080a,
    GuestLdtrSelector = 0x080c,
    GuestTrSelector = 0x080e,
    GuestInterruptStatus = 0x0810,
    GuestPmlIndex = 0x0812,

    // 16-bit host-state fields
    HostEsSelector = 0x0c00,
    HostCsSelector = 0x0c02,
    HostSsSelector = 0x0c04,
    HostDsSelector = 0x0c06,
    HostFsSelector = 0x0c08,
    HostGsSelector = 0x0c0a,
    HostTrSelector = 0x0c0c,

    // 64-bit control fields
    IoBitmapAAddress = 0x2000,
    IoBitmapBAddress = 0x2002,
    MsrBitmapAddress = 0x2004,
    VmExitMsrStoreAddress = 0x2006,
    VmExitMsrLoadAddress = 0x2008,
    VmEntryMsrLoadAddress = 0x200a,
    ExecutiveVmcsPointer = 0x200c,
    PmlAddress = 0x200e,
    TscOffset = 0x2010,
    VirtualApicAddress = 0x2012,
    ApicAccessAddress = 0x2014,
    PostedInterruptDescriptorAddress = 0x2016,
    VmFunctionControls = 0x2018,
    EptPointer = 0x201a,
    EoiExitBitmap0 = 0x201c,
    EoiExitBitmap1 = 0x201e,
    EoiExitBitmap2 = 0x2020,
    EoiExitBitmap3 = 0x2022,
    EptpListAddress = 0x2024,
    VmreadBitmapAddress = 0x2026,
    VmwriteBitmapAddress = 0x2028,
    VirtualizationExceptionInfoAddress = 0x202a,
    XssExitingBitmap = 0x202c,
    EnclsExitingBitmap = 0x202e,
    TscMultiplier = 0x2032,

    // 64-bit read-only data fields
    GuestPhysicalAddress = 0x2400,

    // 64-bit guest-state fields
    VmcsLinkPointer = 0x2800,
    GuestDebugctl = 0x2802,
    GuestPat = 0x2804,
    GuestEfer = 0x2806,
    GuestPerfGlobalCtrl = 0x2808,
    GuestPdpte0 = 0x280a,
    GuestPdpte1 = 0x280c,
    GuestPdpte2 = 0x280e,
    GuestPdpte3 = 0x2810,

    // 64-bit host-state fields
    HostPat = 0x2c00,
    HostEfer = 0x2c02,
    HostPerfGlobalCtrl = 0x2c04,

    // 32-bit control fields
    PinBasedControls = 0x4000,
    PrimaryProcessorControls = 0x4002,
    ExceptionBitmap = 0x4004,
    PageFaultErrorCodeMask = 0x4006,
    PageFaultErrorCodeMatch = 0x4008,
    Cr3TargetCount = 0x400a,
    ExitControls = 0x400c,
    VmExitMsrStoreCount = 0x400e,
    VmExitMsrLoadCount = 0x4010,
    EntryControls = 0x4012,
    VmEntryMsrLoadCount = 0x4014,
    VmEntryInterruptionInfo = 0x4016,
    VmEntryExceptionErrorCode = 0x4018,
    VmEntryInstructionLength = 0x401a,
    TprThreshold = 0x401c,
    SecondaryProcessorControls = 0x401e,
    PleGap = 0x4020,
    PleWindow = 0x4022,

    // 32-bit read-only data fields
    VmInstructionError = 0x4400,
    ExitReason = 0x4402,
    VmExitInterruptionInfo = 0x4404,
    VmExitInterruptionErrorCode = 0x4406,
    IdtVectoringInfo = 0x4408,
    IdtVectoringErrorCode = 0x440a,
    VmExitInstructionLength = 0x440c,
    VmExitInstructionInfo = 0x440e,

    // 32-bit guest-state fields
    GuestEsLimit = 0x4800,
    GuestCsLimit = 0x4802,
    GuestSsLimit = 0x4804,
    GuestDsLimit = 0x4806,
    GuestFsLimit = 0x4808,
    GuestGsLimit = 0x480a,
    GuestLdtrLimit = 0x480c,
    GuestTrLimit = 0x480e,
    GuestGdtrLimit = 0x4810,
    GuestIdtrLimit = 0x4812,
    GuestEsAccessRights = 0x4814,
    GuestCsAccessRights = 0x4816,
    GuestSsAccessRights = 0x4818,
    GuestDsAccessRights = 0x481a,
    GuestFsAccessRights = 0x481c,
    GuestGsAccessRights = 0x481e,
    GuestLdtrAccessRights = 0x4820,
    GuestTrAccessRights = 0x4822,
    GuestInterruptibilityState = 0x4824,
    GuestActivityState = 0x4826,
    GuestSmbase = 0x4828,
    GuestSysenterCs = 0x482a,
    GuestPreemptionTimerValue = 0x482e,

    // 32-bit host-state fields
    HostSysenterCs = 0x4c00,

    // Natural-width control fields
    Cr0GuestHostMask = 0x6000,
    Cr4GuestHostMask = 0x6002,
    Cr0ReadShadow = 0x6004,
    Cr4ReadShadow = 0x6006,
    Cr3TargetValue0 = 0x6008,
    Cr3TargetValue1 = 0x600a,
    Cr3TargetValue2 = 0x600c,
    Cr3TargetValue3 = 0x600e,

    // Natural-width read-only data fields
    ExitQualification = 0x6400,
    IoRcx = 0x6402,
    IoRsi = 0x6404,
    IoRdi = 0x6406,
    IoRip = 0x6408,
    GuestLinearAddress = 0x640a,

    // Natural-width guest-state fields
    GuestCr0 = 0x6800,
    GuestCr3 = 0x6802,
    GuestCr4 = 0x6804,
    GuestEsBase = 0x6806,
    GuestCsBase = 0x6808,
    GuestSsBase = 0x680a,
    GuestDsBase = 0x680c,
    GuestFsBase = 0x680e,
    GuestGsBase = 0x6810,
    GuestLdtrBase = 0x6812,
    GuestTrBase = 0x6814,
    GuestGdtrBase = 0x6816,
    GuestIdtrBase = 0x6818,
    GuestDr7 = 0x681a,
    GuestRsp = 0x681c,
    GuestRip = 0x681e,
    GuestRflags = 0x6820,
    GuestPendingDebugExceptions = 0x6822,
    GuestSysenterEsp = 0x6824,
    GuestSysenterEip = 0x6826,

    // Natural-width host-state fields
    HostCr0 = 0x6c00,
    HostCr3 = 0x6c02,
    HostCr4 = 0x6c04,
    HostFsBase = 0x6c06,
    HostGsBase = 0x6c08,
    HostTrBase = 0x6c0a,
    HostGdtrBase = 0x6c0c,
    HostIdtrBase = 0x6c0e,
    HostSysenterEsp = 0x6c10,
    HostSysenterEip = 0x6c12,
    HostRsp = 0x6c14,
    HostRip = 0x6c16,
}

/// Width of a VMCS component, encoding bits 14:13.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsFieldWidth {
    Word,
    Quad,
    Double,
    Natural,
}

/// Kind of a VMCS component, encoding bits 11:10.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsFieldType {
    Control,
    ExitInformation,
    GuestState,
    HostState,
}

impl VmcsField {
    pub fn encoding(self) -> u32 {
        self as u32
    }

    pub fn width(self) -> VmcsFieldWidth {
        match (self.encoding() >> 13) & 0x3 {
            0 => VmcsFieldWidth::Word,
            1 => VmcsFieldWidth::Quad,
            2 => VmcsFieldWidth::Double,
            _ => VmcsFieldWidth::Natural,
        }
    }

    pub fn field_type(self) -> VmcsFieldType {
        match (self.encoding() >> 10) & 0x3 {
            0 => VmcsFieldType::Control,
            1 => VmcsFieldType::ExitInformation,
            2 => VmcsFieldType::GuestState,
            _ => VmcsFieldType::HostState,
        }
    }

    /// VM-exit information fields cannot be written unless
    /// IA32_VMX_MISC advertises VMWRITE to any field.
    pub fn is_read_only(self) -> bool {
        self.field_type() == VmcsFieldType::ExitInformation
    }
}

/// Failure reported by a VMX instruction through RFLAGS.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum VmFail {
    /// CF set: no current VMCS to hold an error number.
    #[error("VMfailInvalid")]
    Invalid,
    /// ZF set: the error number is in the VM-instruction error field.
    #[error("VMfailValid")]
    Valid,
}

pub type VmxResult<T> = std::result::Result<T, VmFail>;

/// Decodes the outcome of a VMX instruction from the RFLAGS image captured
/// right after it.
pub fn vmx_result(rflags: u64) -> VmxResult<()> {
    if rflags & CF != 0 {
        Err(VmFail::Invalid)
    } else if rflags & ZF != 0 {
        Err(VmFail::Valid)
    } else {
        Ok(())
    }
}

/// Contents of the VM-instruction error field.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum VmInstructionError {
    #[error("VMCALL executed in VMX root operation")]
    VmcallInVmxRoot,
    #[error("VMCLEAR with invalid physical address")]
    VmclearInvalidAddress,
    #[error("VMCLEAR with VMXON pointer")]
    VmclearVmxonPointer,
    #[error("VMLAUNCH with non-clear VMCS")]
    VmlaunchNonClearVmcs,
    #[error("VMRESUME with non-launched VMCS")]
    VmresumeNonLaunchedVmcs,
    #[error("VMRESUME after VMXOFF")]
    VmresumeAfterVmxoff,
    #[error("VM entry with invalid control field(s)")]
    EntryInvalidControlFields,
    #[error("VM entry with invalid host-state field(s)")]
    EntryInvalidHostStateFields,
    #[error("VMPTRLD with invalid physical address")]
    VmptrldInvalidAddress,
    #[error("VMPTRLD with VMXON pointer")]
    VmptrldVmxonPointer,
    #[error("VMPTRLD with incorrect VMCS revision identifier")]
    VmptrldIncorrectRevision,
    #[error("VMREAD/VMWRITE from/to unsupported VMCS component")]
    UnsupportedVmcsComponent,
    #[error("VMWRITE to read-only VMCS component")]
    VmwriteReadOnlyComponent,
    #[error("VMXON executed in VMX root operation")]
    VmxonInVmxRoot,
    #[error("VM entry with invalid executive-VMCS pointer")]
    EntryInvalidExecutiveVmcsPointer,
    #[error("VM entry with non-launched executive VMCS")]
    EntryNonLaunchedExecutiveVmcs,
    #[error("VM entry with executive-VMCS pointer not VMXON pointer")]
    EntryExecutiveVmcsPointerNotVmxon,
    #[error("VMCALL with non-clear VMCS")]
    VmcallNonClearVmcs,
    #[error("VMCALL with invalid VM-exit control fields")]
    VmcallInvalidExitControls,
    #[error("VMCALL with incorrect MSEG revision identifier")]
    VmcallIncorrectMsegRevision,
    #[error("VMXOFF under dual-monitor treatment of SMIs and SMM")]
    VmxoffDualMonitor,
    #[error("VMCALL with invalid SMM-monitor features")]
    VmcallInvalidSmmMonitorFeatures,
    #[error("VM entry with invalid VM-execution control fields in executive VMCS")]
    EntryInvalidExecutiveControls,
    #[error("VM entry with events blocked by MOV SS")]
    EntryEventsBlockedByMovSs,
    #[error("Invalid operand to INVEPT/INVVPID")]
    InvalidInveptInvvpidOperand,
    #[error("Unknown VM-instruction error {0}")]
    Unknown(u32),
    /// The VM-instruction error field could not be read.
    #[error("Failed to retrieve the VM-instruction error")]
    FailedRetrieval,
}

impl VmInstructionError {
    pub fn from_raw(raw: u64) -> Self {
        use VmInstructionError::*;

        match raw {
            1 => VmcallInVmxRoot,
            2 => VmclearInvalidAddress,
            3 => VmclearVmxonPointer,
            4 => VmlaunchNonClearVmcs,
            5 => VmresumeNonLaunchedVmcs,
            6 => VmresumeAfterVmxoff,
            7 => EntryInvalidControlFields,
            8 => EntryInvalidHostStateFields,
            9 => VmptrldInvalidAddress,
            10 => VmptrldVmxonPointer,
            11 => VmptrldIncorrectRevision,
            12 => UnsupportedVmcsComponent,
            13 => VmwriteReadOnlyComponent,
            15 => VmxonInVmxRoot,
            16 => EntryInvalidExecutiveVmcsPointer,
            17 => EntryNonLaunchedExecutiveVmcs,
            18 => EntryExecutiveVmcsPointerNotVmxon,
            19 => VmcallNonClearVmcs,
            20 => VmcallInvalidExitControls,
            22 => VmcallIncorrectMsegRevision,
            23 => VmxoffDualMonitor,
            24 => VmcallInvalidSmmMonitorFeatures,
            25 => EntryInvalidExecutiveControls,
            26 => EntryEventsBlockedByMovSs,
            28 => InvalidInveptInvvpidOperand,
            other => Unknown(other as u32),
        }
    }

    /// Error number as stored in the VMCS. `FailedRetrieval` has none.
    pub fn number(&self) -> Option<u32> {
        use VmInstructionError::*;

        let number = match self {
            VmcallInVmxRoot => 1,
            VmclearInvalidAddress => 2,
            VmclearVmxonPointer => 3,
            VmlaunchNonClearVmcs => 4,
            VmresumeNonLaunchedVmcs => 5,
            VmresumeAfterVmxoff => 6,
            EntryInvalidControlFields => 7,
            EntryInvalidHostStateFields => 8,
            VmptrldInvalidAddress => 9,
            VmptrldVmxonPointer => 10,
            VmptrldIncorrectRevision => 11,
            UnsupportedVmcsComponent => 12,
            VmwriteReadOnlyComponent => 13,
            VmxonInVmxRoot => 15,
            EntryInvalidExecutiveVmcsPointer => 16,
            EntryNonLaunchedExecutiveVmcs => 17,
            EntryExecutiveVmcsPointerNotVmxon => 18,
            VmcallNonClearVmcs => 19,
            VmcallInvalidExitControls => 20,
            VmcallIncorrectMsegRevision => 22,
            VmxoffDualMonitor => 23,
            VmcallInvalidSmmMonitorFeatures => 24,
            EntryInvalidExecutiveControls => 25,
            EntryEventsBlockedByMovSs => 26,
            InvalidInveptInvvpidOperand => 28,
            Unknown(n) => *n,
            FailedRetrieval => return None,
        };
        Some(number)
    }
}

/// INVEPT invalidation types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum InveptType {
    SingleContext = 1,
    AllContext = 2,
}

/// INVVPID invalidation types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum InvvpidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContext = 2,
    SingleContextRetainingGlobals = 3,
}

/// 128-bit INVEPT descriptor.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InveptDescriptor {
    pub eptp: u64,
    pub reserved: u64,
}

impl InveptDescriptor {
    pub fn new(eptp: u64) -> Self {
        InveptDescriptor { eptp, reserved: 0 }
    }
}

/// 128-bit INVVPID descriptor. Bits 63:16 of the first quadword are
/// reserved.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvvpidDescriptor {
    pub vpid: u64,
    pub linear_address: u64,
}

impl InvvpidDescriptor {
    pub fn new(vpid: u16, linear_address: u64) -> Self {
        InvvpidDescriptor {
            vpid: u64::from(vpid),
            linear_address,
        }
    }

    pub fn vpid(&self) -> u16 {
        (self.vpid & 0xffff) as u16
    }
}
