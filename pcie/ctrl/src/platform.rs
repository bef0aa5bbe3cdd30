// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Register access shim and platform collaborator interfaces.
//!
//! The controller owns three register windows (application, bus-core,
//! eDMA) reached through [`RegisterBlock`], plus a set of platform
//! services it does not implement itself: clocks, resets, PHYs, supplies,
//! the external fault-reporting sink, the interconnect bandwidth client
//! and the bus-rescan hook. All of them are injected at construction so
//! the core can be driven against fakes.

use pcie_ctrl_regs::appl::ApplReg;
use pcie_ctrl_regs::dbi::DbiReg;
use pcie_ctrl_regs::dbi;
use pcie_ctrl_regs::edma::DmaReg;
use std::sync::Arc;

/// Raw 32-bit access to one register window.
pub trait RegisterBlock: Send + Sync {
    /// Reads the register at `offset`.
    fn read32(&self, offset: u32) -> u32;
    /// Writes the register at `offset`.
    fn write32(&self, offset: u32, value: u32);
}

/// The application register window.
#[derive(Clone)]
pub struct ApplWindow(Arc<dyn RegisterBlock>);

impl ApplWindow {
    /// Wraps a raw register block.
    pub fn new(block: Arc<dyn RegisterBlock>) -> Self {
        Self(block)
    }

    /// Reads `reg`.
    pub fn read(&self, reg: ApplReg) -> u32 {
        self.0.read32(reg.0)
    }

    /// Writes `reg`.
    pub fn write(&self, reg: ApplReg, value: u32) {
        self.0.write32(reg.0, value);
    }

    /// Read-modify-write of `reg`.
    pub fn update(&self, reg: ApplReg, f: impl FnOnce(u32) -> u32) {
        let value = self.read(reg);
        self.write(reg, f(value));
    }
}

/// The bus-core (DBI) register window.
#[derive(Clone)]
pub struct DbiWindow(Arc<dyn RegisterBlock>);

impl DbiWindow {
    /// Wraps a raw register block.
    pub fn new(block: Arc<dyn RegisterBlock>) -> Self {
        Self(block)
    }

    /// Reads `reg`.
    pub fn read(&self, reg: DbiReg) -> u32 {
        self.0.read32(reg.0)
    }

    /// Writes `reg`.
    pub fn write(&self, reg: DbiReg, value: u32) {
        self.0.write32(reg.0, value);
    }

    /// Read-modify-write of `reg`.
    pub fn update(&self, reg: DbiReg, f: impl FnOnce(u32) -> u32) {
        let value = self.read(reg);
        self.write(reg, f(value));
    }

    /// The link status half-word of the PCIe capability.
    pub fn link_status(&self) -> dbi::LinkStatus {
        dbi::LinkStatus::from_bits((self.read(DbiReg::EXP_LNKCTL_LNKSTA) >> 16) as u16)
    }

    /// Read-modify-write of the link status half-word. Status bits are
    /// write-1-clear, so callers pass back exactly the bits to clear.
    pub fn update_link_status(&self, f: impl FnOnce(dbi::LinkStatus) -> dbi::LinkStatus) {
        self.update(DbiReg::EXP_LNKCTL_LNKSTA, |v| {
            let status = dbi::LinkStatus::from_bits((v >> 16) as u16);
            (v & 0xFFFF) | (f(status).into_bits() as u32) << 16
        });
    }

    /// Read-modify-write of the link control half-word.
    pub fn update_link_control(&self, f: impl FnOnce(dbi::LinkControl) -> dbi::LinkControl) {
        self.update(DbiReg::EXP_LNKCTL_LNKSTA, |v| {
            let control = dbi::LinkControl::from_bits(v as u16);
            // Avoid reflecting the W1C status bits back on the write.
            let v = v & !((dbi::LinkStatus::new()
                .with_link_bandwidth_management_status(true)
                .with_link_autonomous_bandwidth_status(true)
                .into_bits() as u32)
                << 16);
            (v & !0xFFFF) | f(control).into_bits() as u32
        });
    }
}

/// The eDMA register window.
#[derive(Clone)]
pub struct DmaWindow(Arc<dyn RegisterBlock>);

impl DmaWindow {
    /// Wraps a raw register block.
    pub fn new(block: Arc<dyn RegisterBlock>) -> Self {
        Self(block)
    }

    /// Reads `reg`.
    pub fn read(&self, reg: DmaReg) -> u32 {
        self.0.read32(reg.0)
    }

    /// Writes `reg`.
    pub fn write(&self, reg: DmaReg, value: u32) {
        self.0.write32(reg.0, value);
    }

    /// Read-modify-write of `reg`.
    pub fn update(&self, reg: DmaReg, f: impl FnOnce(u32) -> u32) {
        let value = self.read(reg);
        self.write(reg, f(value));
    }
}

/// The port's core clock (and, on safety builds, its monitor clock).
pub trait CoreClock: Send + Sync {
    /// Sets the clock rate in Hz.
    fn set_rate(&self, hz: u64) -> anyhow::Result<()>;
    /// Ungates the clock.
    fn enable(&self) -> anyhow::Result<()>;
    /// Gates the clock.
    fn disable(&self);
}

/// One of the controller's reset lines.
pub trait ResetLine: Send + Sync {
    /// Puts the line into reset.
    fn assert(&self) -> anyhow::Result<()>;
    /// Releases the line from reset.
    fn deassert(&self) -> anyhow::Result<()>;
}

/// A per-lane PHY.
pub trait LanePhy: Send + Sync {
    /// One-time initialization.
    fn init(&self) -> anyhow::Result<()>;
    /// Powers the lane on.
    fn power_on(&self) -> anyhow::Result<()>;
    /// Powers the lane off.
    fn power_off(&self);
    /// Undoes [`LanePhy::init`].
    fn exit(&self);
    /// Re-calibrates the lane after power-on.
    fn calibrate(&self) -> anyhow::Result<()>;
}

/// A supply rail feeding the port or its slot.
pub trait Regulator: Send + Sync {
    /// Enables the rail.
    fn enable(&self) -> anyhow::Result<()>;
    /// Disables the rail.
    fn disable(&self) -> anyhow::Result<()>;
}

/// Partition-level power control for the controller itself.
pub trait PortPower: Send + Sync {
    /// Powers the controller partition up or down.
    fn set_enabled(&self, enabled: bool) -> anyhow::Result<()>;
}

/// The external reference-clock PLL, present with `enable_ext_refclk`.
pub trait RefClkPll: Send + Sync {
    /// Sequences the PLL up or down.
    fn set_enabled(&self, enabled: bool) -> anyhow::Result<()>;
}

/// The external fault-reporting sink.
pub trait FaultSink: Send + Sync {
    /// Reports one contained fault to the safety monitor.
    fn report(&self, error_code: u32, reporter_id: u16, timestamp: u32) -> anyhow::Result<()>;
}

/// The interconnect/memory bandwidth client.
pub trait BandwidthClient: Send + Sync {
    /// Requests a bandwidth floor in bytes per second.
    fn request_bandwidth(&self, bytes_per_second: u64) -> anyhow::Result<()>;
}

/// Bus-rescan hook, invoked after a root-complex link-up transition.
pub trait BusRescan: Send + Sync {
    /// Rescans the bus below this port.
    fn rescan(&self);
}

/// Monotonic hardware counter used to timestamp fault records.
pub trait MonotonicCounter: Send + Sync {
    /// The current counter value.
    fn now(&self) -> u64;
}

/// DMA-visible memory holding the linked-list descriptor rings.
pub trait DescriptorMemory: Send + Sync {
    /// Bus address of the region as seen by the DMA engine.
    fn bus_address(&self) -> u64;
    /// Writes `bytes` at `offset` into the region.
    fn write(&self, offset: usize, bytes: &[u8]);
}

/// Everything the controller consumes from the platform.
pub struct Platform {
    /// Application register window.
    pub appl: ApplWindow,
    /// Bus-core register window.
    pub dbi: DbiWindow,
    /// eDMA register window, on ports that expose the DMA block.
    pub dma: Option<DmaWindow>,
    /// DMA-visible linked-list memory, required for linked-list
    /// transfers.
    pub ll_memory: Option<Arc<dyn DescriptorMemory>>,
    /// The core clock.
    pub core_clock: Arc<dyn CoreClock>,
    /// The monitor clock, on safety builds.
    pub monitor_clock: Option<Arc<dyn CoreClock>>,
    /// Core reset line.
    pub core_rst: Arc<dyn ResetLine>,
    /// Core APB reset line.
    pub core_apb_rst: Arc<dyn ResetLine>,
    /// Per-lane PHYs.
    pub phys: Vec<Arc<dyn LanePhy>>,
    /// Port control supply rail, if software-controlled.
    pub port_supply: Option<Arc<dyn Regulator>>,
    /// Slot supply rails (3.3V, 12V), if software-controlled.
    pub slot_supplies: Vec<Arc<dyn Regulator>>,
    /// Partition power control.
    pub port_power: Arc<dyn PortPower>,
    /// External reference-clock PLL, with `enable_ext_refclk`.
    pub refclk_pll: Option<Arc<dyn RefClkPll>>,
    /// Fault-reporting sink.
    pub fault_sink: Arc<dyn FaultSink>,
    /// Bandwidth client, when an interconnect path exists.
    pub bandwidth: Option<Arc<dyn BandwidthClient>>,
    /// Bus-rescan hook.
    pub rescan: Arc<dyn BusRescan>,
    /// Monotonic counter for fault timestamps.
    pub counter: Arc<dyn MonotonicCounter>,
    /// Bus address programmed into `CFG_BASE_ADDR`.
    pub cfg_base_addr: u64,
    /// Bus address programmed into `CFG_IATU_DMA_BASE_ADDR`.
    pub iatu_dma_base_addr: u64,
}
