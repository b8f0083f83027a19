//! Architectural encodings reported by VMX: basic exit reasons, VM-instruction
//! errors, exception vectors, interruption types and exit qualifications.
//!
//! Every value here is fixed by the Intel® SDM and must stay bit-exact.

use {bit_field::BitField, bitfield::bitfield};

/// Outcome of a VMX instruction that reported VMfail.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.2 CONVENTIONS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxFailure {
    /// VMfailInvalid: CF set, no current VMCS to hold an error number.
    Invalid,
    /// VMfailValid: ZF set, error number in the VM-instruction error field.
    Valid,
}

/// Basic exit reasons (bits 15:0 of the exit reason field).
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Appendix C VMX BASIC EXIT REASONS
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSystemManagementInterrupt = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    VmEntryFailureMachineCheckEvent = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    AccessToGdtrOrIdtr = 46,
    AccessToLdtrOrTr = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    Invvpid = 53,
    WbinvdOrWbnoinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PageModificationLogFull = 62,
    Xsaves = 63,
    Xrstors = 64,
}

impl VmxBasicExitReason {
    /// Decodes the low 16 bits of the exit reason field.
    pub fn from_u32(value: u32) -> Option<Self> {
        use VmxBasicExitReason::*;

        Some(match value & 0xFFFF {
            0 => ExceptionOrNmi,
            1 => ExternalInterrupt,
            2 => TripleFault,
            3 => InitSignal,
            4 => StartupIpi,
            5 => IoSystemManagementInterrupt,
            6 => OtherSmi,
            7 => InterruptWindow,
            8 => NmiWindow,
            9 => TaskSwitch,
            10 => Cpuid,
            11 => Getsec,
            12 => Hlt,
            13 => Invd,
            14 => Invlpg,
            15 => Rdpmc,
            16 => Rdtsc,
            17 => Rsm,
            18 => Vmcall,
            19 => Vmclear,
            20 => Vmlaunch,
            21 => Vmptrld,
            22 => Vmptrst,
            23 => Vmread,
            24 => Vmresume,
            25 => Vmwrite,
            26 => Vmxoff,
            27 => Vmxon,
            28 => ControlRegisterAccesses,
            29 => MovDr,
            30 => IoInstruction,
            31 => Rdmsr,
            32 => Wrmsr,
            33 => VmEntryFailureInvalidGuestState,
            34 => VmEntryFailureMsrLoading,
            36 => Mwait,
            37 => MonitorTrapFlag,
            39 => Monitor,
            40 => Pause,
            41 => VmEntryFailureMachineCheckEvent,
            43 => TprBelowThreshold,
            44 => ApicAccess,
            45 => VirtualizedEoi,
            46 => AccessToGdtrOrIdtr,
            47 => AccessToLdtrOrTr,
            48 => EptViolation,
            49 => EptMisconfiguration,
            50 => Invept,
            51 => Rdtscp,
            52 => VmxPreemptionTimerExpired,
            53 => Invvpid,
            54 => WbinvdOrWbnoinvd,
            55 => Xsetbv,
            56 => ApicWrite,
            57 => Rdrand,
            58 => Invpcid,
            59 => Vmfunc,
            60 => Encls,
            61 => Rdseed,
            62 => PageModificationLogFull,
            63 => Xsaves,
            64 => Xrstors,
            _ => return None,
        })
    }
}

/// Bit 31 of the exit reason: the exit is really a failed VM entry.
pub const EXIT_REASON_ENTRY_FAILURE: u32 = 1 << 31;

/// VM-instruction error numbers.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.4 VM INSTRUCTION ERROR NUMBERS
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmInstructionError {
    VmcallInVmxRoot = 1,
    VmclearInvalidAddress = 2,
    VmclearVmxonPointer = 3,
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmresumeAfterVmxoff = 6,
    EntryInvalidControlFields = 7,
    EntryInvalidHostStateFields = 8,
    VmptrldInvalidAddress = 9,
    VmptrldVmxonPointer = 10,
    VmptrldIncorrectRevision = 11,
    UnsupportedVmcsComponent = 12,
    VmwriteReadOnlyComponent = 13,
    VmxonInVmxRoot = 15,
    EntryInvalidExecutiveVmcsPointer = 16,
    EntryNonLaunchedExecutiveVmcs = 17,
    EntryExecutiveVmcsPointerNotVmxon = 18,
    VmcallNonClearVmcs = 19,
    VmcallInvalidExitControls = 20,
    VmcallIncorrectMsegRevision = 22,
    VmxoffUnderDualMonitor = 23,
    VmcallInvalidSmmMonitorFeatures = 24,
    EntryInvalidExecutiveControls = 25,
    EntryEventsBlockedByMovSs = 26,
    InvalidOperandToInveptInvvpid = 28,
}

impl VmInstructionError {
    pub fn from_u32(value: u32) -> Option<Self> {
        use VmInstructionError::*;

        Some(match value {
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
            23 => VmxoffUnderDualMonitor,
            24 => VmcallInvalidSmmMonitorFeatures,
            25 => EntryInvalidExecutiveControls,
            26 => EntryEventsBlockedByMovSs,
            28 => InvalidOperandToInveptInvvpid,
            _ => return None,
        })
    }
}

/// Exception and interrupt vectors the engine treats specially.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 6-1. Protected-Mode Exceptions and Interrupts
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionInterrupt {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtectionFault = 13,
    PageFault = 14,
    X87FloatingPoint = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPoint = 19,
    VirtualizationException = 20,
    ControlProtection = 21,
}

impl ExceptionInterrupt {
    pub fn from_u32(value: u32) -> Option<Self> {
        use ExceptionInterrupt::*;

        Some(match value {
            0 => DivideError,
            1 => Debug,
            2 => NonMaskableInterrupt,
            3 => Breakpoint,
            4 => Overflow,
            5 => BoundRangeExceeded,
            6 => InvalidOpcode,
            7 => DeviceNotAvailable,
            8 => DoubleFault,
            10 => InvalidTss,
            11 => SegmentNotPresent,
            12 => StackSegmentFault,
            13 => GeneralProtectionFault,
            14 => PageFault,
            16 => X87FloatingPoint,
            17 => AlignmentCheck,
            18 => MachineCheck,
            19 => SimdFloatingPoint,
            20 => VirtualizationException,
            21 => ControlProtection,
            _ => return None,
        })
    }

    /// Exceptions that push an error code when delivered in protected mode.
    pub fn has_error_code(vector: u8) -> bool {
        matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17 | 21)
    }
}

/// Interruption type, bits 10:8 of the interruption-information fields.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

impl InterruptionType {
    pub fn from_u32(value: u32) -> Option<Self> {
        use InterruptionType::*;

        Some(match value {
            0 => ExternalInterrupt,
            2 => NonMaskableInterrupt,
            3 => HardwareException,
            4 => SoftwareInterrupt,
            5 => PrivilegedSoftwareException,
            6 => SoftwareException,
            7 => OtherEvent,
            _ => return None,
        })
    }
}

bitfield! {
    /// Exit qualification for control-register accesses.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
    #[derive(Clone, Copy)]
    pub struct ControlRegAccessExitQualification(u64);
    impl Debug;

    pub control_register, _: 3, 0;
    pub access_type, _: 5, 4;
    pub lmsw_operand_type, _: 6, 6;
    pub general_purpose_register, _: 11, 8;
    pub lmsw_source_data, _: 31, 16;
}

/// Access type, bits 5:4 of [`ControlRegAccessExitQualification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

impl ControlRegAccessExitQualification {
    pub fn kind(&self) -> CrAccessType {
        match self.access_type() {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        }
    }
}

bitfield! {
    /// Exit qualification for MOV DR.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-4. Exit Qualification for MOV DR
    #[derive(Clone, Copy)]
    pub struct DrAccessExitQualification(u64);
    impl Debug;

    pub debug_register, _: 2, 0;
    /// 0 = MOV to DR, 1 = MOV from DR.
    pub direction, _: 4, 4;
    pub general_purpose_register, _: 11, 8;
}

bitfield! {
    /// Exit qualification for I/O instructions.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-5. Exit Qualification for I/O Instructions
    #[derive(Clone, Copy)]
    pub struct IoExitQualification(u64);
    impl Debug;

    /// 0 = 1-byte, 1 = 2-byte, 3 = 4-byte.
    pub size_encoding, _: 2, 0;
    /// 1 = IN.
    pub direction_in, _: 3, 3;
    pub string, _: 4, 4;
    pub rep, _: 5, 5;
    pub port, _: 31, 16;
}

impl IoExitQualification {
    pub fn access_size(&self) -> u8 {
        self.size_encoding() as u8 + 1
    }
}

bitfield! {
    /// Exit qualification for APIC-access VM exits.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-6. Exit Qualification for APIC-Access VM Exits
    #[derive(Clone, Copy)]
    pub struct ApicAccessExitQualification(u64);
    impl Debug;

    pub page_offset, _: 11, 0;
    /// 0 = linear read, 1 = linear write, others are not emulated here.
    pub access_type, _: 15, 12;
}

/// Exit qualification for EPT violations.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-7. Exit Qualification for EPT Violations
#[derive(Debug, Clone, Copy)]
pub struct EptViolationExitQualification {
    pub data_read: bool,
    pub data_write: bool,
    pub instruction_fetch: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl EptViolationExitQualification {
    pub fn from_exit_qualification(qualification: u64) -> Self {
        Self {
            data_read: qualification.get_bit(0),
            data_write: qualification.get_bit(1),
            instruction_fetch: qualification.get_bit(2),
            readable: qualification.get_bit(3),
            writable: qualification.get_bit(4),
            executable: qualification.get_bit(5),
        }
    }

    /// Folds the qualification into a #PF-style error code for the memory service.
    pub fn page_fault_error_code(&self) -> u32 {
        let mut error_code = 0u32;
        error_code.set_bit(0, self.readable || self.writable || self.executable);
        error_code.set_bit(1, self.data_write);
        error_code.set_bit(4, self.instruction_fetch);
        error_code
    }
}
