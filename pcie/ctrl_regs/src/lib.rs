// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants of the PCIe controller's register interface.
//!
//! The controller exposes three register windows:
//!
//! - the *application* (APPL) window: port-global control, the hierarchical
//!   interrupt enable/status/fault registers, and the LTSSM debug view
//!   ([`appl`]);
//! - the *bus-core* (DBI) window: standard config space, capability blocks
//!   and the port-logic registers ([`dbi`]);
//! - the *embedded DMA* (eDMA) window: per-channel transfer registers and
//!   doorbells ([`edma`]).
//!
//! This crate MUST NOT contain any driver policy; it only names bits.

#![forbid(unsafe_code)]

/// Negotiated or targeted link speed, as encoded in the Link Status and
/// Link Control 2 registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LinkSpeed(pub u8);

impl LinkSpeed {
    /// 2.5 GT/s.
    pub const GEN1: Self = Self(1);
    /// 5.0 GT/s.
    pub const GEN2: Self = Self(2);
    /// 8.0 GT/s.
    pub const GEN3: Self = Self(3);
    /// 16.0 GT/s.
    pub const GEN4: Self = Self(4);

    /// Parses a link-speed field, returning `None` for the reserved
    /// encodings (including 0, reported while the link is down).
    pub const fn from_field(bits: u16) -> Option<Self> {
        match bits {
            1..=4 => Some(Self(bits as u8)),
            _ => None,
        }
    }
}

/// Application register window.
pub mod appl {
    use bitfield_struct::bitfield;

    /// Offsets into the application register window.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ApplReg(pub u32);

    #[expect(missing_docs)] // offsets named for the registers they locate
    impl ApplReg {
        pub const PINMUX: Self = Self(0x0);
        pub const CTRL: Self = Self(0x4);
        pub const INTR_EN_L0: Self = Self(0x8);
        pub const INTR_STATUS_L0: Self = Self(0xC);
        pub const FAULT_EN_L0: Self = Self(0x10);
        pub const INTR_EN_L1_0: Self = Self(0x1C);
        pub const INTR_STATUS_L1_0: Self = Self(0x20);
        pub const INTR_STATUS_L1_1: Self = Self(0x2C);
        pub const INTR_STATUS_L1_2: Self = Self(0x30);
        pub const INTR_STATUS_L1_3: Self = Self(0x34);
        pub const INTR_STATUS_L1_6: Self = Self(0x3C);
        pub const INTR_STATUS_L1_7: Self = Self(0x40);
        pub const INTR_EN_L1_8: Self = Self(0x44);
        pub const INTR_STATUS_L1_8: Self = Self(0x4C);
        pub const INTR_STATUS_L1_9: Self = Self(0x54);
        pub const INTR_STATUS_L1_10: Self = Self(0x58);
        pub const FAULT_EN_L1_11: Self = Self(0x5C);
        pub const INTR_EN_L1_11: Self = Self(0x60);
        pub const INTR_STATUS_L1_11: Self = Self(0x64);
        pub const FAULT_EN_L1_12: Self = Self(0x68);
        pub const INTR_EN_L1_12: Self = Self(0x6C);
        pub const INTR_STATUS_L1_12: Self = Self(0x70);
        pub const INTR_STATUS_L1_13: Self = Self(0x74);
        pub const INTR_STATUS_L1_14: Self = Self(0x78);
        pub const INTR_STATUS_L1_15: Self = Self(0x7C);
        pub const INTR_STATUS_L1_17: Self = Self(0x88);
        pub const FAULT_EN_L1_18: Self = Self(0x8C);
        pub const INTR_EN_L1_18: Self = Self(0x90);
        pub const INTR_STATUS_L1_18: Self = Self(0x94);
        pub const MSI_CTRL_1: Self = Self(0xAC);
        pub const MSI_CTRL_2: Self = Self(0xB0);
        pub const LEGACY_INTX: Self = Self(0xB8);
        pub const LTR_MSG_1: Self = Self(0xC4);
        pub const LTR_MSG_2: Self = Self(0xC8);
        pub const LINK_STATUS: Self = Self(0xCC);
        pub const DEBUG: Self = Self(0xD0);
        pub const RADM_STATUS: Self = Self(0xE4);
        pub const DM_TYPE: Self = Self(0x100);
        pub const CFG_BASE_ADDR: Self = Self(0x104);
        pub const CFG_IATU_DMA_BASE_ADDR: Self = Self(0x108);
        pub const CFG_MISC: Self = Self(0x110);
        pub const CFG_SLCG_OVERRIDE: Self = Self(0x114);
        pub const CAR_RESET_OVRD: Self = Self(0x12C);
        pub const FAULT_EN_L1_19: Self = Self(0x17C);
        pub const INTR_EN_L1_19: Self = Self(0x180);
        pub const INTR_STATUS_L1_19: Self = Self(0x184);
        pub const FAULT_EN_L1_20: Self = Self(0x188);
        pub const INTR_EN_L1_20: Self = Self(0x18C);
        pub const INTR_STATUS_L1_20: Self = Self(0x190);
    }

    /// Every status register group cleared by the hot-reset blanket clear,
    /// in write order.
    pub const STATUS_GROUPS: &[ApplReg] = &[
        ApplReg::INTR_STATUS_L0,
        ApplReg::INTR_STATUS_L1_0,
        ApplReg::INTR_STATUS_L1_1,
        ApplReg::INTR_STATUS_L1_2,
        ApplReg::INTR_STATUS_L1_3,
        ApplReg::INTR_STATUS_L1_6,
        ApplReg::INTR_STATUS_L1_7,
        ApplReg::INTR_STATUS_L1_8,
        ApplReg::INTR_STATUS_L1_9,
        ApplReg::INTR_STATUS_L1_10,
        ApplReg::INTR_STATUS_L1_11,
        ApplReg::INTR_STATUS_L1_13,
        ApplReg::INTR_STATUS_L1_14,
        ApplReg::INTR_STATUS_L1_15,
        ApplReg::INTR_STATUS_L1_17,
    ];

    /// Pin multiplexing and sideband-signal overrides.
    #[bitfield(u32)]
    pub struct Pinmux {
        pub pex_rst: bool,
        pub clkreq_in: bool,
        pub clkreq_override_en: bool,
        pub clkreq_override: bool,
        pub clk_output_override_en: bool,
        pub clk_output_override: bool,
        #[bits(7)]
        _reserved1: u32,
        pub clkreq_default_value: bool,
        #[bits(18)]
        _reserved2: u32,
    }

    /// Hardware hot-reset handling mode, [`Ctrl::hot_rst_mode`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HotRstMode(pub u8);

    impl HotRstMode {
        /// Reset the core immediately on hot reset.
        pub const IMMEDIATE_RST: Self = Self(0x1);
        /// Reset the core immediately and leave LTSSM enabled.
        pub const IMMEDIATE_RST_LTSSM_EN: Self = Self(0x2);

        const fn from_bits(bits: u32) -> Self {
            Self(bits as u8)
        }

        const fn into_bits(self) -> u32 {
            self.0 as u32
        }
    }

    /// Port-global control.
    #[bitfield(u32)]
    pub struct Ctrl {
        #[bits(6)]
        _reserved1: u32,
        pub sys_pre_det_state: bool,
        pub ltssm_enable: bool,
        #[bits(12)]
        _reserved2: u32,
        pub hw_hot_rst_enable: bool,
        _reserved3: bool,
        #[bits(2)]
        pub hot_rst_mode: HotRstMode,
        #[bits(8)]
        _reserved4: u32,
    }

    /// Top-level interrupt enables. The same bit positions appear in
    /// [`IntrStatusL0`]; the fault enables ([`FaultEnL0`]) cover the
    /// safety-relevant subset.
    #[bitfield(u32)]
    pub struct IntrEnL0 {
        pub link_state: bool,
        #[bits(3)]
        _reserved1: u32,
        pub msi_rcv: bool,
        #[bits(3)]
        _reserved2: u32,
        pub intx: bool,
        #[bits(2)]
        _reserved3: u32,
        pub tlp_err: bool,
        pub rasdp: bool,
        _reserved4: bool,
        pub parity_err: bool,
        pub pci_cmd: bool,
        pub pex_rst: bool,
        _reserved5: bool,
        pub cdm_reg_chk: bool,
        pub safety_corr: bool,
        pub safety_uncorr: bool,
        #[bits(9)]
        _reserved6: u32,
        pub sys_intr: bool,
        pub sys_msi_intr: bool,
    }

    /// Top-level interrupt status.
    #[bitfield(u32)]
    pub struct IntrStatusL0 {
        pub link_state: bool,
        #[bits(7)]
        _reserved1: u32,
        pub intx: bool,
        #[bits(2)]
        _reserved2: u32,
        pub tlp_err: bool,
        pub rasdp: bool,
        _reserved3: bool,
        pub parity_err: bool,
        pub pci_cmd: bool,
        pub pex_rst: bool,
        _reserved4: bool,
        pub cdm_reg_chk: bool,
        pub safety_corr: bool,
        pub safety_uncorr: bool,
        #[bits(11)]
        _reserved5: u32,
    }

    /// Top-level fault (safety) enables.
    #[bitfield(u32)]
    pub struct FaultEnL0 {
        #[bits(11)]
        _reserved1: u32,
        pub tlp_err: bool,
        pub rasdp: bool,
        _reserved2: bool,
        pub parity_err: bool,
        #[bits(3)]
        _reserved3: u32,
        pub cdm_reg_chk: bool,
        _reserved4: bool,
        pub safety_uncorr: bool,
        #[bits(11)]
        _reserved5: u32,
    }

    /// Link-state interrupt detail (enable and status share the layout).
    #[bitfield(u32)]
    pub struct IntrL1_0 {
        _reserved1: bool,
        pub link_req_rst_not_changed: bool,
        _reserved2: bool,
        pub rdlh_link_up_changed: bool,
        #[bits(26)]
        _reserved3: u32,
        pub hot_reset_done: bool,
        _reserved4: bool,
    }

    /// INTX-group interrupt enables.
    #[bitfield(u32)]
    pub struct IntrEnL1_8 {
        #[bits(2)]
        _reserved1: u32,
        pub bw_mgt: bool,
        pub auto_bw: bool,
        #[bits(2)]
        _reserved2: u32,
        pub edma: bool,
        #[bits(4)]
        _reserved3: u32,
        pub intx: bool,
        #[bits(3)]
        _reserved4: u32,
        pub aer: bool,
        #[bits(16)]
        _reserved5: u32,
    }

    /// INTX-group interrupt status.
    #[bitfield(u32)]
    pub struct IntrStatusL1_8 {
        #[bits(2)]
        _reserved1: u32,
        pub bw_mgt: bool,
        pub auto_bw: bool,
        #[bits(2)]
        _reserved2: u32,
        #[bits(6)]
        pub edma: u32,
        #[bits(20)]
        _reserved3: u32,
    }

    /// TLP-error detail (status, enable and fault-enable share the layout).
    #[bitfield(u32)]
    pub struct IntrL1_11 {
        _reserved1: bool,
        pub fatal: bool,
        pub non_fatal: bool,
        #[bits(29)]
        _reserved2: u32,
    }

    /// RASDP (uncorrectable memory ECC) detail.
    #[bitfield(u32)]
    pub struct IntrL1_12 {
        pub mstr_rasdp: bool,
        pub slv_rasdp: bool,
        #[bits(30)]
        _reserved: u32,
    }

    /// Parity-error sources.
    #[bitfield(u32)]
    pub struct IntrStatusL1_14 {
        #[bits(23)]
        pub sources_low: u32,
        pub retry_ram: bool,
        #[bits(6)]
        pub sources_high: u32,
        #[bits(2)]
        _reserved: u32,
    }

    impl IntrStatusL1_14 {
        /// Any parity source latched, retry-RAM included.
        pub const fn any_source(&self) -> bool {
            self.into_bits() & 0x3FFF_FFFF != 0
        }

        /// Any parity source besides the benign retry-RAM bit.
        pub const fn any_besides_retry_ram(&self) -> bool {
            self.into_bits() & 0x3FFF_FFFF & !(1 << 23) != 0
        }
    }

    /// PCI-command change detail.
    #[bitfield(u32)]
    pub struct IntrStatusL1_15 {
        _reserved1: bool,
        pub cfg_bme_changed: bool,
        #[bits(30)]
        _reserved2: u32,
    }

    /// CDM register-check detail (status, enable and fault-enable share
    /// the layout).
    #[bitfield(u32)]
    pub struct IntrL1_18 {
        pub cdm_logic_err: bool,
        pub cdm_cmp_err: bool,
        pub cdm_chk_complete: bool,
        #[bits(29)]
        _reserved: u32,
    }

    /// Safety-correctable detail.
    #[bitfield(u32)]
    pub struct IntrL1_19 {
        pub safety_corr: bool,
        #[bits(31)]
        _reserved: u32,
    }

    /// Safety-uncorrectable detail (status, enable and fault-enable share
    /// the layout).
    #[bitfield(u32)]
    pub struct IntrL1_20 {
        pub safety_uncorr: bool,
        pub if_timeout: bool,
        #[bits(30)]
        _reserved: u32,
    }

    /// LTR message request/handshake.
    #[bitfield(u32)]
    pub struct LtrMsg2 {
        #[bits(3)]
        _reserved1: u32,
        pub ltr_msg_req_state: bool,
        #[bits(28)]
        _reserved2: u32,
    }

    /// Data-link layer view of the link.
    #[bitfield(u32)]
    pub struct LinkStatus {
        pub rdlh_link_up: bool,
        #[bits(31)]
        _reserved: u32,
    }

    /// LTSSM training state, normalized to the 6-bit field of
    /// [`Debug::ltssm_state`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct LtssmState(pub u8);

    impl LtssmState {
        /// Detect.Quiet.
        pub const DETECT_QUIET: Self = Self(0x00);
        /// Detect.Active.
        pub const DETECT_ACT: Self = Self(0x01);
        /// Pre-Detect.Quiet.
        pub const PRE_DETECT_QUIET: Self = Self(0x05);
        /// Detect.Wait.
        pub const DETECT_WAIT: Self = Self(0x06);
        /// Waiting in the data-link layer with the link not reported up.
        pub const DL_WAIT: Self = Self(0x11);
        /// L2.Idle.
        pub const L2_IDLE: Self = Self(0x15);

        /// Whether the state is one of the detect/quiet states the LTSSM
        /// settles into once the far end stops responding.
        pub const fn is_detect(&self) -> bool {
            matches!(
                *self,
                Self::DETECT_QUIET | Self::DETECT_ACT | Self::PRE_DETECT_QUIET | Self::DETECT_WAIT
            )
        }

        const fn from_bits(bits: u32) -> Self {
            Self(bits as u8)
        }

        const fn into_bits(self) -> u32 {
            self.0 as u32
        }
    }

    /// LTSSM/power debug view.
    #[bitfield(u32)]
    pub struct Debug {
        #[bits(3)]
        _reserved1: u32,
        #[bits(6)]
        pub ltssm_state: LtssmState,
        #[bits(12)]
        _reserved2: u32,
        pub pm_linkst_in_l2_lat: bool,
        #[bits(10)]
        _reserved3: u32,
    }

    /// RADM (receive path) status/control.
    #[bitfield(u32)]
    pub struct RadmStatus {
        pub pm_xmt_turnoff: bool,
        #[bits(31)]
        _reserved: u32,
    }

    /// Device-mode selector, [`DmType::dm_type`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DmTypeValue(pub u8);

    impl DmTypeValue {
        /// Root port.
        pub const ROOT_PORT: Self = Self(0x4);
        /// Endpoint.
        pub const ENDPOINT: Self = Self(0x0);

        const fn from_bits(bits: u32) -> Self {
            Self(bits as u8)
        }

        const fn into_bits(self) -> u32 {
            self.0 as u32
        }
    }

    /// Device-mode register.
    #[bitfield(u32)]
    pub struct DmType {
        #[bits(4)]
        pub dm_type: DmTypeValue,
        #[bits(28)]
        _reserved: u32,
    }

    /// Miscellaneous configuration.
    #[bitfield(u32)]
    pub struct CfgMisc {
        #[bits(10)]
        _reserved1: u32,
        #[bits(4)]
        pub arcache: u8,
        pub slv_ep_mode: bool,
        #[bits(17)]
        _reserved2: u32,
    }

    /// ARCACHE value programmed for coherent upstream reads.
    pub const CFG_MISC_ARCACHE_VAL: u8 = 3;

    /// Core-reset override used by the secondary-bus-reset workaround.
    #[bitfield(u32)]
    pub struct CarResetOvrd {
        pub cya_override_core_rst_n: bool,
        #[bits(31)]
        _reserved: u32,
    }
}

/// Bus-core (DBI) register window: config space and port logic.
pub mod dbi {
    use bitfield_struct::bitfield;

    /// Offsets into the bus-core register window.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DbiReg(pub u32);

    #[expect(missing_docs)] // offsets named for the registers they locate
    impl DbiReg {
        pub const COMMAND: Self = Self(0x04);
        pub const BAR0: Self = Self(0x10);
        pub const IO_BASE: Self = Self(0x1C);
        pub const PREF_MEMORY_BASE: Self = Self(0x24);

        // PCI Express capability block. The window is dword-addressed, so
        // the 16-bit control/status registers pair up: DEVCTL/DEVSTA at
        // +0x8, LNKCTL/LNKSTA at +0x10, LNKCTL2/LNKSTA2 at +0x30 (control
        // in the low half-word, status in the high half-word).
        pub const EXP_DEVCTL_DEVSTA: Self = Self(0x70 + 0x8);
        pub const EXP_LNKCAP: Self = Self(0x70 + 0xC);
        pub const EXP_LNKCTL_LNKSTA: Self = Self(0x70 + 0x10);
        pub const EXP_LNKCTL2_LNKSTA2: Self = Self(0x70 + 0x30);

        // Lane margining/equalization capability blocks.
        pub const SPCIE_CAP: Self = Self(0x154);
        pub const PL16G_LE_CTRL: Self = Self(0x188);

        // L1 substates capability block.
        pub const L1SS_CAP: Self = Self(0x168 + 0x4);
        pub const L1SS_CTL1: Self = Self(0x168 + 0x8);

        // Data link feature extended capability block.
        pub const DLF_CAP: Self = Self(0x2F8 + 0x4);

        // AER root error status (root ports).
        pub const AER_ROOT_ERR_STATUS: Self = Self(0x100 + 0x30);

        // Port logic.
        pub const LINK_WIDTH_SPEED_CONTROL: Self = Self(0x80C);
        pub const MSI_CTRL_INT_0_EN: Self = Self(0x828);
        pub const GEN3_RELATED: Self = Self(0x890);
        pub const GEN3_EQ_CONTROL: Self = Self(0x8A8);
        pub const AMBA_ERROR_RESPONSE_DEFAULT: Self = Self(0x8D0);
        pub const PL_IF_TIMER_CONTROL: Self = Self(0x930);
        pub const PL_INTERFACE_TIMER_STATUS: Self = Self(0x938);
        pub const PL_SAFETY_MASK: Self = Self(0x960);
        pub const PL_SAFETY_STATUS: Self = Self(0x964);
        pub const PL_CHK_REG_CONTROL_STATUS: Self = Self(0xB20);
        pub const PL_CHK_REG_ERR_ADDR: Self = Self(0xB28);
    }

    /// PCI command register (low half of STATUS_COMMAND).
    #[bitfield(u32)]
    pub struct Command {
        _reserved1: bool,
        pub memory_space: bool,
        pub bus_master: bool,
        #[bits(5)]
        _reserved2: u32,
        pub serr_enable: bool,
        #[bits(23)]
        _reserved3: u32,
    }

    /// Device Control register of the PCI Express capability.
    #[bitfield(u16)]
    pub struct DeviceControl {
        pub correctable_error_reporting_enable: bool,
        pub non_fatal_error_reporting_enable: bool,
        pub fatal_error_reporting_enable: bool,
        pub unsupported_request_reporting_enable: bool,
        pub enable_relaxed_ordering: bool,
        #[bits(3)]
        pub max_payload_size: u16,
        #[bits(8)]
        _reserved: u16,
    }

    /// Max payload size encoding for 256 bytes.
    pub const PAYLOAD_256B: u16 = 0b001;

    /// Link Capabilities register.
    #[bitfield(u32)]
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
        #[bits(14)]
        _reserved: u32,
    }

    /// Link Control register.
    #[bitfield(u16)]
    pub struct LinkControl {
        #[bits(2)]
        pub aspm_control: u16,
        #[bits(3)]
        _reserved1: u16,
        pub retrain_link: bool,
        #[bits(4)]
        _reserved2: u16,
        pub lbm_interrupt_enable: bool,
        #[bits(5)]
        _reserved3: u16,
    }

    /// Link Status register.
    #[bitfield(u16)]
    pub struct LinkStatus {
        #[bits(4)]
        pub current_link_speed: u16,
        #[bits(6)]
        pub negotiated_link_width: u16,
        #[bits(2)]
        _reserved1: u16,
        pub slot_clock_config: bool,
        pub data_link_layer_active: bool,
        pub link_bandwidth_management_status: bool,
        pub link_autonomous_bandwidth_status: bool,
    }

    /// Link Control 2 register.
    #[bitfield(u16)]
    pub struct LinkControl2 {
        #[bits(4)]
        pub target_link_speed: u16,
        #[bits(12)]
        _reserved: u16,
    }

    /// L1 substates capability register.
    #[bitfield(u32)]
    pub struct L1ssCap {
        pub pcipm_l1_2: bool,
        pub pcipm_l1_1: bool,
        pub aspm_l1_2: bool,
        pub aspm_l1_1: bool,
        pub l1ss_supported: bool,
        #[bits(27)]
        _reserved: u32,
    }

    /// Data link feature capability register.
    #[bitfield(u32)]
    pub struct DlfCap {
        #[bits(31)]
        _reserved: u32,
        pub exchange_enable: bool,
    }

    /// Port-logic link width/speed control.
    #[bitfield(u32)]
    pub struct LinkWidthSpeedControl {
        #[bits(17)]
        _reserved1: u32,
        pub speed_change: bool,
        #[bits(14)]
        _reserved2: u32,
    }

    /// Port-logic Gen3-related control.
    #[bitfield(u32)]
    pub struct Gen3Related {
        pub zrxdc_noncompl: bool,
        #[bits(15)]
        _reserved1: u32,
        pub eq_disable: bool,
        #[bits(7)]
        _reserved2: u32,
        #[bits(2)]
        pub rate_shadow_sel: u8,
        #[bits(6)]
        _reserved3: u32,
    }

    /// Port-logic Gen3/Gen4 equalization control.
    #[bitfield(u32)]
    pub struct Gen3EqControl {
        #[bits(4)]
        pub fb_mode: u8,
        #[bits(4)]
        _reserved1: u32,
        #[bits(16)]
        pub pset_req_vec: u32,
        #[bits(8)]
        _reserved2: u32,
    }

    /// AMBA bridge error-response policy.
    #[bitfield(u32)]
    pub struct AmbaErrorResponse {
        #[bits(3)]
        _reserved1: u32,
        #[bits(2)]
        pub crs: CrsResponse,
        #[bits(27)]
        _reserved2: u32,
    }

    /// Completion-retry-status response encodings,
    /// [`AmbaErrorResponse::crs`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct CrsResponse(pub u8);

    impl CrsResponse {
        /// Complete the AMBA transaction with OKAY.
        pub const OKAY: Self = Self(0);
        /// OKAY with all-ones data.
        pub const OKAY_FFFFFFFF: Self = Self(1);
        /// OKAY with 0xFFFF0001 data (vendor/device ID retry encoding).
        pub const OKAY_FFFF0001: Self = Self(2);

        const fn from_bits(bits: u32) -> Self {
            Self(bits as u8)
        }

        const fn into_bits(self) -> u32 {
            self.0 as u32
        }
    }

    /// Interface-transaction timer control.
    #[bitfield(u32)]
    pub struct PlIfTimerControl {
        pub if_timer_en: bool,
        pub if_timer_aer_en: bool,
        #[bits(30)]
        _reserved: u32,
    }

    /// Safety logic mask (status shares the layout).
    #[bitfield(u32)]
    pub struct PlSafetyMask {
        pub rasdp: bool,
        pub cdm: bool,
        pub if_timeout: bool,
        pub uncor: bool,
        pub cor: bool,
        pub rasdp_cor: bool,
        #[bits(26)]
        _reserved: u32,
    }

    /// CDM register-check control/status.
    #[bitfield(u32)]
    pub struct PlChkRegControlStatus {
        pub start: bool,
        pub continuous: bool,
        #[bits(14)]
        _reserved1: u32,
        pub comparison_error: bool,
        pub logic_error: bool,
        pub complete: bool,
        #[bits(13)]
        _reserved2: u32,
    }

    /// Per-lane equalization preset fields of the secondary-PCIe
    /// capability.
    #[bitfield(u16)]
    pub struct SpcieLaneCtl {
        #[bits(4)]
        pub dsp_tx_preset0: u8,
        #[bits(4)]
        _reserved1: u16,
        #[bits(4)]
        pub usp_tx_preset0: u8,
        #[bits(4)]
        _reserved2: u16,
    }
}

/// Embedded DMA register window and descriptor layout.
pub mod edma {
    use bitfield_struct::bitfield;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// Number of write (local memory to remote) channels.
    pub const WR_CHANNEL_COUNT: usize = 4;
    /// Number of read (remote to local memory) channels.
    pub const RD_CHANNEL_COUNT: usize = 2;

    /// Offsets of the engine-global registers.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DmaReg(pub u32);

    #[expect(missing_docs)] // offsets named for the registers they locate
    impl DmaReg {
        pub const WRITE_ENGINE_EN: Self = Self(0x00C);
        pub const WRITE_DOORBELL: Self = Self(0x010);
        pub const READ_ENGINE_EN: Self = Self(0x02C);
        pub const READ_DOORBELL: Self = Self(0x030);
        pub const WRITE_INT_STATUS: Self = Self(0x04C);
        pub const WRITE_INT_MASK: Self = Self(0x054);
        pub const WRITE_INT_CLEAR: Self = Self(0x058);
        pub const READ_INT_STATUS: Self = Self(0x0A0);
        pub const READ_INT_MASK: Self = Self(0x0A8);
        pub const READ_INT_CLEAR: Self = Self(0x0AC);
    }

    /// Registers within a channel's register file.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ChReg(pub u32);

    #[expect(missing_docs)] // offsets named for the registers they locate
    impl ChReg {
        pub const CONTROL1: Self = Self(0x00);
        pub const TRANSFER_SIZE: Self = Self(0x08);
        pub const SAR_LOW: Self = Self(0x0C);
        pub const SAR_HIGH: Self = Self(0x10);
        pub const DAR_LOW: Self = Self(0x14);
        pub const DAR_HIGH: Self = Self(0x18);
        pub const LLP_LOW: Self = Self(0x1C);
        pub const LLP_HIGH: Self = Self(0x20);
    }

    /// Offset of `reg` in write channel `ch`'s register file.
    pub const fn wr_ch_reg(ch: usize, reg: ChReg) -> DmaReg {
        DmaReg(0x200 * (ch as u32 + 1) + reg.0)
    }

    /// Offset of `reg` in read channel `ch`'s register file.
    pub const fn rd_ch_reg(ch: usize, reg: ChReg) -> DmaReg {
        DmaReg(0x200 * (ch as u32 + 1) + 0x100 + reg.0)
    }

    /// Channel control word. The same layout is used for the first dword
    /// of a linked-list element.
    #[bitfield(u32)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct ChControl1 {
        pub cycle: bool,
        pub toggle_cycle: bool,
        pub load_link_pointer: bool,
        pub local_interrupt_enable: bool,
        pub remote_interrupt_enable: bool,
        #[bits(3)]
        _reserved1: u32,
        pub consumer_cycle_state: bool,
        pub linked_list_enable: bool,
        #[bits(22)]
        _reserved2: u32,
    }

    /// Done interrupt bits for the low channels plus the matching abort
    /// bits shifted into the high half-word, as laid out in the int
    /// status/mask/clear registers.
    pub const fn channel_int_bits(channel_count: usize) -> u32 {
        let done = (1u32 << channel_count) - 1;
        done | done << 16
    }

    /// One element of an in-memory linked-list (scatter/gather) chain.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct LlElement {
        /// Element control word; every element sets
        /// [`ChControl1::cycle`], the final element of a chain also sets
        /// the completion-interrupt flag(s).
        pub control: ChControl1,
        /// Transfer size in bytes.
        pub transfer_size: u32,
        /// Source address, low dword.
        pub sar_low: u32,
        /// Source address, high dword.
        pub sar_high: u32,
        /// Destination address, low dword.
        pub dar_low: u32,
        /// Destination address, high dword.
        pub dar_high: u32,
    }

    impl LlElement {
        /// Size of a serialized element in bytes.
        pub const SIZE: usize = size_of::<Self>();
    }
}

#[cfg(test)]
mod tests {
    use super::appl;
    use super::dbi;
    use super::edma;

    #[test]
    fn ltssm_state_field_extraction() {
        // Raw APPL_DEBUG values observed on hardware: state lives in
        // bits 3..=8.
        let debug = appl::Debug::from_bits(0xa8);
        assert_eq!(debug.ltssm_state(), appl::LtssmState::L2_IDLE);
        let debug = appl::Debug::from_bits(0x30);
        assert_eq!(debug.ltssm_state(), appl::LtssmState::DETECT_WAIT);
        assert!(debug.ltssm_state().is_detect());
        let debug = appl::Debug::from_bits(0x11 << 3);
        assert_eq!(debug.ltssm_state(), appl::LtssmState::DL_WAIT);
        assert!(!debug.ltssm_state().is_detect());
    }

    #[test]
    fn parity_retry_ram_boundary() {
        let only_retry_ram = appl::IntrStatusL1_14::from_bits(1 << 23);
        assert!(only_retry_ram.any_source());
        assert!(!only_retry_ram.any_besides_retry_ram());

        let retry_ram_plus_other = appl::IntrStatusL1_14::from_bits(1 << 23 | 1 << 2);
        assert!(retry_ram_plus_other.any_besides_retry_ram());

        let reserved_only = appl::IntrStatusL1_14::from_bits(0xC000_0000);
        assert!(!reserved_only.any_source());
    }

    #[test]
    fn link_status_fields() {
        // Gen3 x4, DLL active.
        let sta = dbi::LinkStatus::from_bits(0x2043);
        assert_eq!(sta.current_link_speed(), 3);
        assert_eq!(sta.negotiated_link_width(), 4);
        assert!(sta.data_link_layer_active());
        assert!(!sta.link_bandwidth_management_status());
    }

    #[test]
    fn edma_channel_register_files() {
        assert_eq!(edma::wr_ch_reg(0, edma::ChReg::CONTROL1).0, 0x200);
        assert_eq!(edma::wr_ch_reg(2, edma::ChReg::TRANSFER_SIZE).0, 0x608);
        assert_eq!(edma::rd_ch_reg(0, edma::ChReg::LLP_LOW).0, 0x31C);
        assert_eq!(edma::channel_int_bits(4), 0x000F_000F);
        assert_eq!(edma::channel_int_bits(2), 0x0003_0003);
    }

    #[test]
    fn ll_element_layout() {
        use zerocopy::IntoBytes;

        assert_eq!(edma::LlElement::SIZE, 24);
        let element = edma::LlElement {
            control: edma::ChControl1::new()
                .with_cycle(true)
                .with_local_interrupt_enable(true),
            transfer_size: 0x1000,
            sar_low: 0x8000_0000,
            sar_high: 0x1,
            dar_low: 0x4000_0000,
            dar_high: 0x2,
        };
        let bytes = element.as_bytes();
        assert_eq!(&bytes[0..4], &[0x09, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0x00, 0x10, 0, 0]);
    }
}
