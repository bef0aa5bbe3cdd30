// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Static configuration injected into the controller at construction.
//!
//! Everything here is decided by the embedding platform before attach:
//! which physical port this is, how many lanes are wired, which
//! workarounds the IP revision needs, and the lookup tables the external
//! safety and bandwidth consumers key off. None of it changes over the
//! life of a controller instance.

use pcie_ctrl_regs::LinkSpeed;
use std::time::Duration;

/// Identity of a physical controller instance. Indexes the fault report
/// table, so an out-of-range id is unrepresentable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[expect(missing_docs)] // one variant per hardware port
pub enum InstanceId {
    Ctl0,
    Ctl1,
    Ctl2,
    Ctl3,
    Ctl4,
    Ctl5,
    Ctl6,
    Ctl7,
    Ctl8,
    Ctl9,
    Ctl10,
}

impl InstanceId {
    /// Number of controller instances.
    pub const COUNT: usize = 11;

    /// Zero-based index of this instance.
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// The (error_code, reporter_id) pair the external safety monitor expects
/// from one controller instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FaultReportId {
    /// Identifies the reporting controller to the safety monitor.
    pub reporter_id: u16,
    /// The error code registered for that reporter.
    pub error_code: u32,
}

/// Per-instance fault report identities.
///
/// The default table must be reproduced exactly for interoperability with
/// the external safety-monitoring consumer; it is injected rather than
/// hardcoded so bench setups can substitute their own identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReportTable([FaultReportId; InstanceId::COUNT]);

impl FaultReportTable {
    /// The production identity table.
    pub const PRODUCTION: Self = {
        const fn id(reporter_id: u16, error_code: u32) -> FaultReportId {
            FaultReportId {
                reporter_id,
                error_code,
            }
        }
        Self([
            id(0x8023, 0x211e),
            id(0x8024, 0x211f),
            id(0x8025, 0x2120),
            id(0x8026, 0x2121),
            id(0x8027, 0x2122),
            id(0x8028, 0x2123),
            id(0x8029, 0x2124),
            id(0x802a, 0x2125),
            id(0x802b, 0x2126),
            id(0x802c, 0x2127),
            id(0x802d, 0x212a),
        ])
    };

    /// The identity for `instance`.
    pub fn get(&self, instance: InstanceId) -> FaultReportId {
        self.0[instance.index()]
    }
}

/// Core clock rate for a negotiated link speed.
pub const fn core_clock_rate(speed: LinkSpeed) -> u64 {
    match speed {
        LinkSpeed::GEN1 => 62_500_000,
        LinkSpeed::GEN2 => 125_000_000,
        LinkSpeed::GEN3 => 250_000_000,
        _ => 500_000_000,
    }
}

/// Memory-bandwidth floor table, one row per link width (x1/x2/x4/x8),
/// one column per generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DvfsTable(pub [[u64; 4]; 4]);

impl DvfsTable {
    /// The bandwidth floor in bytes per second for a negotiated
    /// (width, speed) pair.
    pub fn floor(&self, width: u8, speed: LinkSpeed) -> u64 {
        let row = (width.max(1).trailing_zeros() as usize).min(3);
        let col = (speed.0 as usize - 1).min(3);
        self.0[row][col]
    }
}

impl Default for DvfsTable {
    fn default() -> Self {
        // Raw link rate less 8b/10b (Gen1/2) or 128b/130b (Gen3/4)
        // encoding overhead, per lane.
        const LANE_BPS: [u64; 4] = [250_000_000, 500_000_000, 984_615_384, 1_969_230_769];
        let mut table = [[0; 4]; 4];
        let mut row = 0;
        while row < 4 {
            let mut col = 0;
            while col < 4 {
                table[row][col] = LANE_BPS[col] << row;
                col += 1;
            }
            row += 1;
        }
        Self(table)
    }
}

/// ASPM link power states whose advertisement is suppressed.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DisabledAspmStates {
    /// L0s.
    pub l0s: bool,
    /// L1 (implies the L1 substates).
    pub l1: bool,
    /// ASPM L1.1.
    pub l1_1: bool,
    /// ASPM L1.2.
    pub l1_2: bool,
}

/// Timeouts and polling intervals for every bounded wait in the core.
///
/// Injected so tests run against an emulated register bank in
/// milliseconds; the defaults are the production values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Total link bring-up budget, shared by the initial attempt and the
    /// one DLF-disabled retry.
    pub link_up_budget: Duration,
    /// Longest a single link-up wait may poll.
    pub link_up_attempt: Duration,
    /// Link-up polling interval.
    pub link_poll_interval: Duration,
    /// PERST assertion pulse width during bring-up.
    pub perst_pulse: Duration,
    /// Settling time after PERST deassertion.
    pub perst_settle: Duration,
    /// PME turnoff acknowledge deadline.
    pub pme_ack: Duration,
    /// PME acknowledge polling interval.
    pub pme_ack_interval: Duration,
    /// LTSSM settle deadline (detect/quiet states).
    pub ltssm: Duration,
    /// LTSSM settle polling interval.
    pub ltssm_interval: Duration,
    /// DMA completion deadline per submission.
    pub dma: Duration,
    /// LTR message acknowledge deadline.
    pub ltr: Duration,
    /// LTR acknowledge polling interval.
    pub ltr_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            link_up_budget: Duration::from_millis(1800),
            link_up_attempt: Duration::from_millis(900),
            link_poll_interval: Duration::from_millis(90),
            perst_pulse: Duration::from_micros(150),
            perst_settle: Duration::from_millis(100),
            pme_ack: Duration::from_millis(10),
            pme_ack_interval: Duration::from_micros(100),
            ltssm: Duration::from_millis(120),
            ltssm_interval: Duration::from_millis(10),
            dma: Duration::from_secs(5),
            ltr: Duration::from_millis(100),
            ltr_interval: Duration::from_millis(1),
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Which physical port this controller instance is.
    pub instance: InstanceId,
    /// Wired lane count, advertised in the link capabilities.
    pub num_lanes: u8,
    /// Highest speed the port trains to.
    pub target_speed: LinkSpeed,
    /// ASPM states suppressed by policy.
    pub disabled_aspm: DisabledAspmStates,
    /// Whether CLKREQ# is routed to the slot. Without it the L1 substates
    /// cannot be advertised and the CLKREQ input is overridden.
    pub supports_clkreq: bool,
    /// Separate-refclk (SRNS) configuration: the slot clock bit is
    /// cleared and the REFCLK output pads are gated.
    pub enable_srns: bool,
    /// The port's reference clock comes from an external PLL that must be
    /// sequenced with the port.
    pub enable_ext_refclk: bool,
    /// Enable the configuration-register consistency monitor.
    pub enable_cdm_check: bool,
    /// Safety build: fault interrupts are armed and the core clock stays
    /// pinned at the Gen4 rate under a monitor clock.
    pub is_safety_platform: bool,
    /// IP revisions that need the core-reset override pulse on secondary
    /// bus reset and hot-reset mode managed around suspend.
    pub sbr_reset_workaround: bool,
    /// Defer the upstream LTR message until the first Bus-Master-Enable
    /// transition instead of sending it at initialization.
    pub bme_triggered_ltr: bool,
    /// Gen4 equalization preset request vector.
    pub gen4_preset_request_vector: u16,
    /// Capacity of the endpoint lifecycle event queue.
    pub event_queue_capacity: usize,
    /// Every bounded wait in the core.
    pub timeouts: Timeouts,
    /// Per-instance fault report identities.
    pub fault_reports: FaultReportTable,
    /// Bandwidth floors by negotiated width and speed.
    pub dvfs: DvfsTable,
}

impl ControllerConfig {
    /// A root-port configuration with production defaults.
    pub fn new(instance: InstanceId, num_lanes: u8) -> Self {
        Self {
            instance,
            num_lanes,
            target_speed: LinkSpeed::GEN4,
            disabled_aspm: DisabledAspmStates::default(),
            supports_clkreq: false,
            enable_srns: false,
            enable_ext_refclk: false,
            enable_cdm_check: false,
            is_safety_platform: false,
            sbr_reset_workaround: false,
            bme_triggered_ltr: true,
            gen4_preset_request_vector: 0x360,
            event_queue_capacity: 256,
            timeouts: Timeouts::default(),
            fault_reports: FaultReportTable::PRODUCTION,
            dvfs: DvfsTable::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_fault_report_table() {
        // These pairs are a contract with the external safety monitor.
        let table = FaultReportTable::PRODUCTION;
        assert_eq!(
            table.get(InstanceId::Ctl0),
            FaultReportId {
                reporter_id: 0x8023,
                error_code: 0x211e
            }
        );
        assert_eq!(
            table.get(InstanceId::Ctl9),
            FaultReportId {
                reporter_id: 0x802c,
                error_code: 0x2127
            }
        );
        // The last entry skips ahead in the error-code space.
        assert_eq!(
            table.get(InstanceId::Ctl10),
            FaultReportId {
                reporter_id: 0x802d,
                error_code: 0x212a
            }
        );
    }

    #[test]
    fn core_clock_rates_per_generation() {
        assert_eq!(core_clock_rate(LinkSpeed::GEN1), 62_500_000);
        assert_eq!(core_clock_rate(LinkSpeed::GEN2), 125_000_000);
        assert_eq!(core_clock_rate(LinkSpeed::GEN3), 250_000_000);
        assert_eq!(core_clock_rate(LinkSpeed::GEN4), 500_000_000);
    }

    #[test]
    fn dvfs_floor_indexes_by_width_and_speed() {
        let table = DvfsTable::default();
        // x1 Gen1 is the smallest floor, x8 Gen4 the largest.
        assert!(table.floor(1, LinkSpeed::GEN1) < table.floor(8, LinkSpeed::GEN4));
        // Doubling the width doubles the floor.
        assert_eq!(
            table.floor(2, LinkSpeed::GEN3),
            2 * table.floor(1, LinkSpeed::GEN3)
        );
        // Out-of-range widths clamp rather than panic.
        assert_eq!(
            table.floor(16, LinkSpeed::GEN4),
            table.floor(8, LinkSpeed::GEN4)
        );
    }
}
