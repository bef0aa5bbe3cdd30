// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles: an in-memory register bank with scriptable hardware
//! behaviors and recording fakes for every platform collaborator.

use crate::platform::ApplWindow;
use crate::platform::BandwidthClient;
use crate::platform::BusRescan;
use crate::platform::CoreClock;
use crate::platform::DbiWindow;
use crate::platform::DescriptorMemory;
use crate::platform::DmaWindow;
use crate::platform::FaultSink;
use crate::platform::LanePhy;
use crate::platform::MonotonicCounter;
use crate::platform::Platform;
use crate::platform::PortPower;
use crate::platform::RefClkPll;
use crate::platform::Regulator;
use crate::platform::RegisterBlock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

type WriteRule = Arc<dyn Fn(&TestRegisterBank, u32, u32) + Send + Sync>;

/// An in-memory register window.
///
/// Registers default to read/write with all-zero reset values. Tests can
/// mark registers write-1-clear, link a separate clear register to a
/// status register (the eDMA int-clear arrangement), and install
/// write rules that emulate hardware reactions (e.g. "link comes up once
/// LTSSM is enabled").
pub struct TestRegisterBank {
    regs: Mutex<HashMap<u32, u32>>,
    w1c: Mutex<HashSet<u32>>,
    clear_links: Mutex<HashMap<u32, u32>>,
    write_log: Mutex<Vec<(u32, u32)>>,
    rules: Mutex<Vec<WriteRule>>,
}

impl TestRegisterBank {
    pub fn new() -> Self {
        Self {
            regs: Mutex::new(HashMap::new()),
            w1c: Mutex::new(HashSet::new()),
            clear_links: Mutex::new(HashMap::new()),
            write_log: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
        }
    }

    /// Reads a register without side effects.
    pub fn peek(&self, offset: u32) -> u32 {
        self.regs.lock().get(&offset).copied().unwrap_or(0)
    }

    /// Sets a register from the "hardware" side.
    pub fn poke(&self, offset: u32, value: u32) {
        self.regs.lock().insert(offset, value);
    }

    /// ORs bits into a register from the "hardware" side.
    pub fn poke_bits(&self, offset: u32, bits: u32) {
        *self.regs.lock().entry(offset).or_insert(0) |= bits;
    }

    /// Sets a register and marks it write-1-clear.
    pub fn poke_w1c(&self, offset: u32, value: u32) {
        self.w1c.lock().insert(offset);
        self.poke(offset, value);
    }

    /// ORs bits into `status` and routes writes of `clear` to clear the
    /// matching bits in `status`.
    pub fn poke_w1c_via(&self, status: u32, clear: u32, bits: u32) {
        self.clear_links.lock().insert(clear, status);
        self.poke_bits(status, bits);
    }

    /// Installs a rule run after every write.
    pub fn on_write(&self, rule: impl Fn(&TestRegisterBank, u32, u32) + Send + Sync + 'static) {
        self.rules.lock().push(Arc::new(rule));
    }

    /// Every write issued through the window, in order.
    pub fn write_log(&self) -> Vec<(u32, u32)> {
        self.write_log.lock().clone()
    }

    /// Number of writes issued through the window.
    pub fn write_count(&self) -> usize {
        self.write_log.lock().len()
    }
}

impl RegisterBlock for TestRegisterBank {
    fn read32(&self, offset: u32) -> u32 {
        self.peek(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.write_log.lock().push((offset, value));

        if let Some(&status) = self.clear_links.lock().get(&offset) {
            let mut regs = self.regs.lock();
            let current = regs.get(&status).copied().unwrap_or(0);
            regs.insert(status, current & !value);
        } else if self.w1c.lock().contains(&offset) {
            let mut regs = self.regs.lock();
            let current = regs.get(&offset).copied().unwrap_or(0);
            regs.insert(offset, current & !value);
        } else {
            self.regs.lock().insert(offset, value);
        }

        let rules: Vec<WriteRule> = self.rules.lock().clone();
        for rule in rules {
            rule(self, offset, value);
        }
    }
}

/// DMA-visible memory backed by a plain buffer.
pub struct TestDescriptorMemory {
    base: u64,
    data: Mutex<Vec<u8>>,
}

impl TestDescriptorMemory {
    pub fn new(base: u64, len: usize) -> Self {
        Self {
            base,
            data: Mutex::new(vec![0; len]),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl DescriptorMemory for TestDescriptorMemory {
    fn bus_address(&self) -> u64 {
        self.base
    }

    fn write(&self, offset: usize, bytes: &[u8]) {
        self.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

#[derive(Default)]
pub struct TestClock {
    pub rates: Mutex<Vec<u64>>,
    pub enabled: AtomicBool,
    pub fail_enable: AtomicBool,
}

impl TestClock {
    pub fn last_rate(&self) -> Option<u64> {
        self.rates.lock().last().copied()
    }
}

impl CoreClock for TestClock {
    fn set_rate(&self, hz: u64) -> anyhow::Result<()> {
        self.rates.lock().push(hz);
        Ok(())
    }

    fn enable(&self) -> anyhow::Result<()> {
        if self.fail_enable.load(Ordering::Relaxed) {
            anyhow::bail!("clock enable failed");
        }
        self.enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct TestResetLine {
    pub asserted: AtomicBool,
    pub assert_count: AtomicU32,
    pub deassert_count: AtomicU32,
}

impl crate::platform::ResetLine for TestResetLine {
    fn assert(&self) -> anyhow::Result<()> {
        self.asserted.store(true, Ordering::Relaxed);
        self.assert_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn deassert(&self) -> anyhow::Result<()> {
        self.asserted.store(false, Ordering::Relaxed);
        self.deassert_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestPhy {
    pub initialized: AtomicBool,
    pub powered: AtomicBool,
    pub calibrations: AtomicU32,
    pub fail_power_on: AtomicBool,
}

impl LanePhy for TestPhy {
    fn init(&self) -> anyhow::Result<()> {
        self.initialized.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn power_on(&self) -> anyhow::Result<()> {
        if self.fail_power_on.load(Ordering::Relaxed) {
            anyhow::bail!("phy power-on failed");
        }
        self.powered.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn power_off(&self) {
        self.powered.store(false, Ordering::Relaxed);
    }

    fn exit(&self) {
        self.initialized.store(false, Ordering::Relaxed);
    }

    fn calibrate(&self) -> anyhow::Result<()> {
        self.calibrations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestRegulator {
    pub enabled: AtomicBool,
}

impl Regulator for TestRegulator {
    fn enable(&self) -> anyhow::Result<()> {
        self.enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn disable(&self) -> anyhow::Result<()> {
        self.enabled.store(false, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestPortPower {
    pub enabled: AtomicBool,
}

impl PortPower for TestPortPower {
    fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        self.enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestRefClkPll {
    pub enabled: AtomicBool,
}

impl RefClkPll for TestRefClkPll {
    fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        self.enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestFaultSink {
    pub reports: Mutex<Vec<(u32, u16, u32)>>,
    pub fail: AtomicBool,
}

impl FaultSink for TestFaultSink {
    fn report(&self, error_code: u32, reporter_id: u16, timestamp: u32) -> anyhow::Result<()> {
        self.reports.lock().push((error_code, reporter_id, timestamp));
        if self.fail.load(Ordering::Relaxed) {
            anyhow::bail!("sink rejected the report");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct TestBandwidth {
    pub requests: Mutex<Vec<u64>>,
}

impl BandwidthClient for TestBandwidth {
    fn request_bandwidth(&self, bytes_per_second: u64) -> anyhow::Result<()> {
        self.requests.lock().push(bytes_per_second);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestRescan {
    pub rescans: AtomicU32,
}

impl BusRescan for TestRescan {
    fn rescan(&self) {
        self.rescans.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct TestCounter {
    pub ticks: AtomicU64,
}

impl MonotonicCounter for TestCounter {
    fn now(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 0x1000
    }
}

/// Handles to every fake inside a [`Platform`], for assertions.
pub struct TestPlatformHandles {
    pub appl: Arc<TestRegisterBank>,
    pub dbi: Arc<TestRegisterBank>,
    pub dma: Arc<TestRegisterBank>,
    pub ll: Arc<TestDescriptorMemory>,
    pub core_clock: Arc<TestClock>,
    pub monitor_clock: Arc<TestClock>,
    pub core_rst: Arc<TestResetLine>,
    pub core_apb_rst: Arc<TestResetLine>,
    pub phys: Vec<Arc<TestPhy>>,
    pub port_supply: Arc<TestRegulator>,
    pub port_power: Arc<TestPortPower>,
    pub fault_sink: Arc<TestFaultSink>,
    pub bandwidth: Arc<TestBandwidth>,
    pub rescan: Arc<TestRescan>,
}

/// Builds a [`Platform`] where every collaborator records what happened
/// to it.
pub fn test_platform(lanes: usize, with_dma: bool) -> (Arc<Platform>, TestPlatformHandles) {
    let appl = Arc::new(TestRegisterBank::new());
    let dbi = Arc::new(TestRegisterBank::new());
    let dma = Arc::new(TestRegisterBank::new());
    let ll = Arc::new(TestDescriptorMemory::new(0x9000_0000, 16384));
    let core_clock = Arc::new(TestClock::default());
    let monitor_clock = Arc::new(TestClock::default());
    let core_rst = Arc::new(TestResetLine::default());
    let core_apb_rst = Arc::new(TestResetLine::default());
    let phys: Vec<Arc<TestPhy>> = (0..lanes).map(|_| Arc::new(TestPhy::default())).collect();
    let port_supply = Arc::new(TestRegulator::default());
    let port_power = Arc::new(TestPortPower::default());
    let fault_sink = Arc::new(TestFaultSink::default());
    let bandwidth = Arc::new(TestBandwidth::default());
    let rescan = Arc::new(TestRescan::default());

    let platform = Arc::new(Platform {
        appl: ApplWindow::new(appl.clone()),
        dbi: DbiWindow::new(dbi.clone()),
        dma: with_dma.then(|| DmaWindow::new(dma.clone())),
        ll_memory: with_dma.then(|| ll.clone() as Arc<dyn DescriptorMemory>),
        core_clock: core_clock.clone(),
        monitor_clock: Some(monitor_clock.clone()),
        core_rst: core_rst.clone(),
        core_apb_rst: core_apb_rst.clone(),
        phys: phys.iter().map(|p| p.clone() as Arc<dyn LanePhy>).collect(),
        port_supply: Some(port_supply.clone()),
        slot_supplies: Vec::new(),
        port_power: port_power.clone(),
        refclk_pll: None,
        fault_sink: fault_sink.clone(),
        bandwidth: Some(bandwidth.clone()),
        rescan: rescan.clone(),
        counter: Arc::new(TestCounter::default()),
        cfg_base_addr: 0x3800_0000,
        iatu_dma_base_addr: 0x3804_0000,
    });

    let handles = TestPlatformHandles {
        appl,
        dbi,
        dma,
        ll,
        core_clock,
        monitor_clock,
        core_rst,
        core_apb_rst,
        phys,
        port_supply,
        port_power,
        fault_sink,
        bandwidth,
        rescan,
    };
    (platform, handles)
}

/// Timeouts scaled down so tests exercise the same polling paths in
/// milliseconds.
pub fn fast_timeouts() -> crate::config::Timeouts {
    use std::time::Duration;
    crate::config::Timeouts {
        link_up_budget: Duration::from_millis(80),
        link_up_attempt: Duration::from_millis(30),
        link_poll_interval: Duration::from_millis(2),
        perst_pulse: Duration::from_micros(50),
        perst_settle: Duration::from_millis(1),
        pme_ack: Duration::from_millis(20),
        pme_ack_interval: Duration::from_millis(1),
        ltssm: Duration::from_millis(20),
        ltssm_interval: Duration::from_millis(1),
        dma: Duration::from_millis(100),
        ltr: Duration::from_millis(20),
        ltr_interval: Duration::from_millis(1),
    }
}

/// Scripts "link trains successfully" behavior: once LTSSM is enabled in
/// APPL_CTRL, the data-link layer reports active at the given width and
/// speed.
pub fn script_link_up(
    appl: &Arc<TestRegisterBank>,
    dbi: &Arc<TestRegisterBank>,
    width: u16,
    speed: u16,
) {
    use pcie_ctrl_regs::appl::ApplReg;
    use pcie_ctrl_regs::dbi::DbiReg;

    let dbi = dbi.clone();
    appl.on_write(move |bank, offset, value| {
        if offset == ApplReg::CTRL.0 && value & 1 << 7 != 0 {
            bank.poke_bits(ApplReg::LINK_STATUS.0, 1);
            let status = pcie_ctrl_regs::dbi::LinkStatus::new()
                .with_current_link_speed(speed)
                .with_negotiated_link_width(width)
                .with_data_link_layer_active(true);
            let ctl_sta = dbi.peek(DbiReg::EXP_LNKCTL_LNKSTA.0) & 0xFFFF
                | (status.into_bits() as u32) << 16;
            dbi.poke(DbiReg::EXP_LNKCTL_LNKSTA.0, ctl_sta);
        }
    });
}
