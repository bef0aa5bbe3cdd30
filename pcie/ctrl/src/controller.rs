// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mode controller: top-level orchestration, interrupt dispatch and the
//! endpoint lifecycle.
//!
//! One hardware interrupt line delivers a coalesced status word. The top
//! half ([`Controller::handle_interrupt`]) reads the top-level status,
//! fans out to the link manager, the DMA engine and the fault classifier,
//! and never blocks: anything that may (fault reporting, bus rescans,
//! clock-rate changes, the endpoint lifecycle) is handed off through
//! bounded queues to the worker threads.
//!
//! The controller has two personalities selected at construction. Both
//! share the fault classifier and the DMA engine; they differ in link and
//! power sequencing: a root complex configures and trains at attach,
//! while an endpoint sits idle until the host deasserts PERST.

use crate::config::ControllerConfig;
use crate::config::core_clock_rate;
use crate::edma::DmaEngine;
use crate::event::EventQueue;
use crate::fault::FaultClassifier;
use crate::fault::FaultEvent;
use crate::fault::FaultRecord;
use crate::link::LinkManager;
use crate::link::LinkState;
use crate::platform::Platform;
use crate::poll::poll_until;
use crate::power::PowerState;
use crate::power::PowerStateController;
use anyhow::Context;
use parking_lot::Condvar;
use parking_lot::Mutex;
use pcie_ctrl_regs::appl::ApplReg;
use pcie_ctrl_regs::appl;
use pcie_ctrl_regs::dbi::DbiReg;
use pcie_ctrl_regs::dbi;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// The controller's personality.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Root complex: configures and trains the link at attach, owns the
    /// bus below the port.
    RootComplex,
    /// Endpoint: waits for the host to sequence PERST, reacts to
    /// host-driven lifecycle events.
    Endpoint,
}

/// Endpoint lifecycle events, delivered through the bounded event queue
/// to the endpoint worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EpEvent {
    /// The host asserted PERST#: tear the endpoint down.
    RstAssert,
    /// The host deasserted PERST#: configure and enable the endpoint.
    RstDeassert,
    /// The controller finished a hardware hot reset.
    HotResetDone,
    /// The host toggled Bus Master Enable.
    BmeChanged,
    /// Terminate the endpoint worker.
    Exit,
}

/// Deferred work handed from the top half to the bottom-half worker.
enum Deferred {
    /// Report a contained fault to the external sink.
    Fault(FaultEvent),
    /// The link came up: rescan (root complex) and rescale clocks.
    LinkUp,
    /// The link changed speed: rescale clocks.
    SpeedChange,
    /// Terminate the worker.
    Shutdown,
}

/// One PCIe controller port.
pub struct Controller {
    mode: Mode,
    cfg: Arc<ControllerConfig>,
    platform: Arc<Platform>,
    link: LinkManager,
    power: PowerStateController,
    faults: FaultClassifier,
    dma: Option<DmaEngine>,
    deferred: EventQueue<Deferred>,
    ep_events: EventQueue<EpEvent>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ep_enabled: AtomicBool,
    config_ready: Mutex<bool>,
    config_ready_cv: Condvar,
}

impl Controller {
    /// Creates a controller over the given platform. Nothing is touched
    /// until [`Controller::start`].
    pub fn new(mode: Mode, cfg: ControllerConfig, platform: Arc<Platform>) -> Arc<Self> {
        let cfg = Arc::new(cfg);
        let link = LinkManager::new(
            platform.appl.clone(),
            platform.dbi.clone(),
            platform.core_rst.clone(),
            platform.core_clock.clone(),
            cfg.clone(),
        );
        let power = PowerStateController::new(platform.clone(), cfg.clone());
        let faults = FaultClassifier::new(platform.appl.clone(), platform.dbi.clone());
        let dma = platform.dma.clone().map(|window| {
            DmaEngine::new(window, platform.ll_memory.clone(), cfg.timeouts.dma)
        });

        Arc::new(Self {
            mode,
            cfg: cfg.clone(),
            platform,
            link,
            power,
            faults,
            dma,
            deferred: EventQueue::new(cfg.event_queue_capacity),
            ep_events: EventQueue::new(cfg.event_queue_capacity),
            workers: Mutex::new(Vec::new()),
            ep_enabled: AtomicBool::new(false),
            config_ready: Mutex::new(false),
            config_ready_cv: Condvar::new(),
        })
    }

    /// The controller's personality.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The current link state.
    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    /// The current power state.
    pub fn power_state(&self) -> PowerState {
        self.power.state()
    }

    /// The DMA engine, on ports that expose the local DMA block.
    pub fn dma(&self) -> Option<&DmaEngine> {
        self.dma.as_ref()
    }

    /// Spawns the workers and, in root-complex mode, configures the port
    /// and brings the link up.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        {
            let this = self.clone();
            let worker = std::thread::Builder::new()
                .name("pcie-ctrl".into())
                .spawn(move || this.worker_loop())
                .context("failed to spawn controller worker")?;
            self.workers.lock().push(worker);
        }
        if self.mode == Mode::Endpoint {
            let this = self.clone();
            let worker = std::thread::Builder::new()
                .name("pcie-ctrl-ep".into())
                .spawn(move || this.ep_worker_loop())
                .context("failed to spawn endpoint worker")?;
            self.workers.lock().push(worker);
        }

        let result = match self.mode {
            Mode::RootComplex => self.attach_root_port(),
            Mode::Endpoint => Ok(()),
        };
        self.mark_config_ready();
        result
    }

    /// Stops the workers and powers the port down.
    pub fn detach(&self) {
        let _ = self.deferred.push(Deferred::Shutdown);
        let _ = self.ep_events.push(EpEvent::Exit);
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }

        match self.mode {
            Mode::RootComplex => {
                if self.power.state() == PowerState::Active {
                    self.power.teardown_reporting();
                    self.power.enter_l2(&self.link);
                    self.power.unconfigure_port();
                }
            }
            Mode::Endpoint => self.ep_perst_assert(),
        }
    }

    fn attach_root_port(&self) -> anyhow::Result<()> {
        self.power
            .configure_port(Mode::RootComplex, false)
            .context("failed to configure controller")?;
        if self.cfg.is_safety_platform {
            if let Some(clock) = &self.platform.monitor_clock {
                clock.enable().context("failed to enable monitor clock")?;
            }
        }

        let trained = self.link.bring_up();
        // Interrupts are armed even when training failed, so a late
        // partner still raises a link-state event.
        self.enable_rp_interrupts();

        match trained {
            Ok((width, speed)) => {
                self.apply_link_rate(width, speed);
                Ok(())
            }
            Err(err) => {
                self.power.unconfigure_port();
                Err(anyhow::Error::from(err).context("link did not come up at attach"))
            }
        }
    }

    /// Top-half interrupt handler. Must not block: reads the top-level
    /// status, routes to the sub-handlers and schedules deferred work.
    pub fn handle_interrupt(&self) {
        let status_l0 =
            appl::IntrStatusL0::from_bits(self.platform.appl.read(ApplReg::INTR_STATUS_L0));
        match self.mode {
            Mode::RootComplex => self.rp_interrupt(status_l0),
            Mode::Endpoint => self.ep_interrupt(status_l0),
        }
    }

    fn rp_interrupt(&self, status_l0: appl::IntrStatusL0) {
        let appl = &self.platform.appl;

        if status_l0.link_state() {
            let status = appl::IntrL1_0::from_bits(appl.read(ApplReg::INTR_STATUS_L1_0));
            appl.write(ApplReg::INTR_STATUS_L1_0, status.into_bits());

            if self.cfg.sbr_reset_workaround && status.link_req_rst_not_changed() {
                self.link.apply_sbr_workaround();
            }
            if status.rdlh_link_up_changed() {
                let link_status =
                    appl::LinkStatus::from_bits(appl.read(ApplReg::LINK_STATUS));
                if link_status.rdlh_link_up() {
                    info!("link is up");
                    self.push_deferred(Deferred::LinkUp);
                }
            }
        }

        if status_l0.intx() {
            let status = appl::IntrStatusL1_8::from_bits(appl.read(ApplReg::INTR_STATUS_L1_8));
            if status.edma() != 0 {
                if let Some(dma) = &self.dma {
                    dma.handle_interrupt();
                }
            }
            if status.auto_bw() {
                appl.write(
                    ApplReg::INTR_STATUS_L1_8,
                    appl::IntrStatusL1_8::new().with_auto_bw(true).into_bits(),
                );
                self.link.apply_bad_link_workaround();
            }
            if status.bw_mgt() {
                let speed = self.link.acknowledge_bandwidth_change();
                appl.write(
                    ApplReg::INTR_STATUS_L1_8,
                    appl::IntrStatusL1_8::new().with_bw_mgt(true).into_bits(),
                );
                debug!(speed = speed.map(|s| s.0), "link bandwidth changed");
                self.push_deferred(Deferred::SpeedChange);
            }
        }

        self.faults
            .classify(status_l0, |event| self.push_deferred(Deferred::Fault(event)));
    }

    fn ep_interrupt(&self, status_l0: appl::IntrStatusL0) {
        let appl = &self.platform.appl;

        if status_l0.link_state() {
            let status = appl::IntrL1_0::from_bits(appl.read(ApplReg::INTR_STATUS_L1_0));
            appl.write(ApplReg::INTR_STATUS_L1_0, status.into_bits());

            if status.hot_reset_done() {
                self.push_ep_event(EpEvent::HotResetDone);
            }
            if status.rdlh_link_up_changed() {
                let link_status =
                    appl::LinkStatus::from_bits(appl.read(ApplReg::LINK_STATUS));
                if link_status.rdlh_link_up() {
                    debug!("link is up with host");
                    self.push_deferred(Deferred::LinkUp);
                }
            }
        }

        if status_l0.pci_cmd() {
            let status =
                appl::IntrStatusL1_15::from_bits(appl.read(ApplReg::INTR_STATUS_L1_15));
            appl.write(ApplReg::INTR_STATUS_L1_15, status.into_bits());
            if status.cfg_bme_changed() {
                self.push_ep_event(EpEvent::BmeChanged);
            }
        }

        self.faults
            .classify(status_l0, |event| self.push_deferred(Deferred::Fault(event)));
    }

    /// Surfaces a PERST# level change from the environment (endpoint
    /// mode).
    pub fn ep_perst_changed(&self, asserted: bool) {
        let event = if asserted {
            EpEvent::RstAssert
        } else {
            EpEvent::RstDeassert
        };
        self.push_ep_event(event);
    }

    /// Raises a legacy interrupt toward the host (endpoint mode).
    pub fn raise_intx(&self) {
        self.platform.appl.write(ApplReg::LEGACY_INTX, 1);
        std::thread::sleep(std::time::Duration::from_micros(100));
        self.platform.appl.write(ApplReg::LEGACY_INTX, 0);
    }

    /// Raises MSI vector `vector` toward the host (endpoint mode).
    pub fn raise_msi(&self, vector: u8) -> anyhow::Result<()> {
        if vector > 31 {
            anyhow::bail!("MSI vector {vector} out of range");
        }
        self.platform.appl.write(ApplReg::MSI_CTRL_1, 1 << vector);
        Ok(())
    }

    fn push_deferred(&self, work: Deferred) {
        if let Err(err) = self.deferred.push(work) {
            error!(error = %err, "deferred work lost; controller state is suspect");
        }
    }

    fn push_ep_event(&self, event: EpEvent) {
        if let Err(err) = self.ep_events.push(event) {
            error!(?event, error = %err, "endpoint lifecycle event lost");
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            match self.deferred.pop() {
                Deferred::Shutdown => break,
                Deferred::Fault(event) => self.report_fault(event),
                Deferred::LinkUp => {
                    if self.mode == Mode::RootComplex {
                        self.platform.rescan.rescan();
                    }
                    self.apply_negotiated_link_rate();
                }
                Deferred::SpeedChange => self.apply_negotiated_link_rate(),
            }
        }
    }

    fn ep_worker_loop(self: Arc<Self>) {
        loop {
            match self.ep_events.pop() {
                EpEvent::Exit => break,
                EpEvent::RstAssert => self.ep_perst_assert(),
                EpEvent::RstDeassert => {
                    // PERST can fire before attach-time initialization
                    // finished; configuration must not start until it
                    // has.
                    self.wait_config_ready();
                    self.ep_perst_deassert();
                }
                EpEvent::HotResetDone => self.power.hot_reset_done(),
                EpEvent::BmeChanged => self.handle_bme_change(),
            }
        }
    }

    fn report_fault(&self, event: FaultEvent) {
        let record = FaultRecord {
            category: event.category,
            raw_status: event.raw_status,
            timestamp: self.platform.counter.now() as u32,
        };
        let id = self.cfg.fault_reports.get(self.cfg.instance);
        info!(
            category = ?record.category,
            raw_status = record.raw_status,
            timestamp = record.timestamp,
            "reporting contained fault"
        );
        if let Err(err) = self
            .platform
            .fault_sink
            .report(id.error_code, id.reporter_id, record.timestamp)
        {
            error!(error = %err, "failed to report fault");
        }
    }

    fn apply_negotiated_link_rate(&self) {
        if let Some((width, speed)) = self.link.negotiated() {
            self.apply_link_rate(width, speed);
        }
    }

    fn apply_link_rate(&self, width: u8, speed: pcie_ctrl_regs::LinkSpeed) {
        if let Some(bandwidth) = &self.platform.bandwidth {
            let floor = self.cfg.dvfs.floor(width, speed);
            if let Err(err) = bandwidth.request_bandwidth(floor) {
                error!(error = %err, floor, "can't set bandwidth floor");
            }
        }

        // Safety builds keep the core pinned at the Gen4 rate under the
        // monitor clock; everyone else tracks the negotiated speed.
        if !self.cfg.is_safety_platform {
            if let Err(err) = self.platform.core_clock.set_rate(core_clock_rate(speed)) {
                error!(error = %err, "can't set core clock rate");
            }
        }
    }

    fn handle_bme_change(&self) {
        if !self.cfg.bme_triggered_ltr {
            return;
        }

        // Nothing to tell upstream if the partner never advertised the
        // L1 substates.
        let l1ss = dbi::L1ssCap::from_bits(self.platform.dbi.read(DbiReg::L1SS_CAP));
        if !(l1ss.aspm_l1_1() || l1ss.aspm_l1_2()) {
            return;
        }

        let command = dbi::Command::from_bits(self.platform.dbi.read(DbiReg::COMMAND));
        if command.bus_master() {
            self.send_ltr_message();
        }
    }

    fn send_ltr_message(&self) {
        let appl = &self.platform.appl;
        appl.update(ApplReg::LTR_MSG_2, |v| {
            appl::LtrMsg2::from_bits(v).with_ltr_msg_req_state(true).into_bits()
        });

        let acked = poll_until(
            || {
                !appl::LtrMsg2::from_bits(appl.read(ApplReg::LTR_MSG_2)).ltr_msg_req_state()
            },
            self.cfg.timeouts.ltr_interval,
            self.cfg.timeouts.ltr,
        );
        if acked.is_err() {
            // Policy timeout: logged, not fatal — the port keeps running
            // without the latency hint.
            error!("failed to send LTR message");
        }
    }

    fn ep_perst_deassert(&self) {
        if self.ep_enabled.load(Ordering::Acquire) {
            return;
        }

        if let Err(err) = self.power.configure_port(Mode::Endpoint, false) {
            error!(error = %err, "failed to configure endpoint");
            return;
        }
        if self.cfg.is_safety_platform {
            if let Some(clock) = &self.platform.monitor_clock {
                if let Err(err) = clock.enable() {
                    error!(error = %err, "failed to enable monitor clock");
                    self.power.unconfigure_port();
                    return;
                }
            }
        }

        let appl = &self.platform.appl;

        // Drop any status latched while the port was held in reset.
        for &group in appl::STATUS_GROUPS {
            appl.write(group, 0xFFFF_FFFF);
        }

        appl.update(ApplReg::CTRL, |v| {
            appl::Ctrl::from_bits(v).with_hw_hot_rst_enable(true).into_bits()
        });

        self.enable_ep_interrupts();

        // 110us LTR defaults for both snoop and no-snoop.
        let ltr: u32 = 110 | 2 << 10 | 1 << 15;
        appl.write(ApplReg::LTR_MSG_1, ltr | ltr << 16);

        self.link.prepare_endpoint();

        if self.cfg.is_safety_platform {
            self.faults.enable_fault_interrupts();
        }

        if !self.cfg.bme_triggered_ltr {
            appl.update(ApplReg::LTR_MSG_2, |v| {
                appl::LtrMsg2::from_bits(v).with_ltr_msg_req_state(true).into_bits()
            });
        }

        appl.update(ApplReg::CTRL, |v| {
            appl::Ctrl::from_bits(v).with_ltssm_enable(true).into_bits()
        });

        self.ep_enabled.store(true, Ordering::Release);
        debug!("initialization of endpoint is completed");
    }

    fn ep_perst_assert(&self) {
        if !self.ep_enabled.swap(false, Ordering::AcqRel) {
            return;
        }

        let appl = &self.platform.appl;

        // Wait for the LTSSM to settle before cutting power; a port torn
        // down mid-training wedges the partner.
        let settled = poll_until(
            || {
                let state =
                    appl::Debug::from_bits(appl.read(ApplReg::DEBUG)).ltssm_state();
                state.is_detect() || state == appl::LtssmState::L2_IDLE
            },
            self.cfg.timeouts.ltssm_interval,
            self.cfg.timeouts.ltssm,
        );
        if settled.is_err() {
            let state = appl::Debug::from_bits(appl.read(ApplReg::DEBUG)).ltssm_state();
            error!(ltssm_state = state.0, "LTSSM settle timeout");
        }

        appl.update(ApplReg::CTRL, |v| {
            appl::Ctrl::from_bits(v).with_ltssm_enable(false).into_bits()
        });

        if self.cfg.is_safety_platform {
            if let Some(clock) = &self.platform.monitor_clock {
                clock.disable();
            }
        }

        self.power.unconfigure_port();
        self.link.mark_down();
        debug!("uninitialization of endpoint is completed");
    }

    fn enable_rp_interrupts(&self) {
        let appl = &self.platform.appl;

        // Clear stale statuses before arming anything.
        for &group in appl::STATUS_GROUPS {
            appl.write(group, 0xFFFF_FFFF);
        }

        // System interrupts: link state changes.
        appl.update(ApplReg::INTR_EN_L0, |v| {
            appl::IntrEnL0::from_bits(v).with_link_state(true).into_bits()
        });
        if self.cfg.sbr_reset_workaround {
            appl.update(ApplReg::INTR_EN_L1_0, |v| {
                appl::IntrL1_0::from_bits(v)
                    .with_link_req_rst_not_changed(true)
                    .into_bits()
            });
        }

        if self.cfg.enable_cdm_check {
            self.faults.enable_cdm_check();
        }
        if self.cfg.is_safety_platform {
            self.faults.enable_fault_interrupts();
        }

        self.link.enable_bandwidth_notifications();

        // Legacy interrupt generation: INTX, bandwidth, eDMA and AER all
        // funnel through the INTX group.
        appl.update(ApplReg::INTR_EN_L0, |v| {
            appl::IntrEnL0::from_bits(v)
                .with_sys_intr(true)
                .with_intx(true)
                .into_bits()
        });
        appl.update(ApplReg::INTR_EN_L1_8, |v| {
            appl::IntrEnL1_8::from_bits(v)
                .with_intx(true)
                .with_auto_bw(true)
                .with_bw_mgt(true)
                .with_edma(true)
                .with_aer(true)
                .into_bits()
        });

        // MSI reception.
        appl.update(ApplReg::INTR_EN_L0, |v| {
            appl::IntrEnL0::from_bits(v)
                .with_sys_msi_intr(true)
                .with_msi_rcv(true)
                .into_bits()
        });
    }

    fn enable_ep_interrupts(&self) {
        let appl = &self.platform.appl;

        appl.update(ApplReg::INTR_EN_L0, |v| {
            appl::IntrEnL0::from_bits(v)
                .with_sys_intr(true)
                .with_link_state(true)
                .with_pci_cmd(true)
                .with_intx(true)
                .into_bits()
        });
        appl.update(ApplReg::INTR_EN_L1_0, |v| {
            appl::IntrL1_0::from_bits(v)
                .with_hot_reset_done(true)
                .with_rdlh_link_up_changed(true)
                .into_bits()
        });
        appl.update(ApplReg::INTR_EN_L1_8, |v| {
            appl::IntrEnL1_8::from_bits(v).with_edma(true).into_bits()
        });

        if self.cfg.enable_cdm_check {
            self.faults.enable_cdm_check();
        }
    }

    /// Root-complex suspend, late stage: arm hardware hot reset for the
    /// suspend window.
    pub fn suspend_late(&self) {
        if self.cfg.sbr_reset_workaround {
            self.power.enable_hw_hot_reset_mode();
        }
    }

    /// Root-complex suspend, no-IRQ stage: save volatile state, hand the
    /// port to L2 and deconfigure it. No register access is valid after
    /// this returns until [`Controller::resume_noirq`].
    pub fn suspend_noirq(&self) {
        self.power.save_msi_vectors();
        self.power.enter_l2(&self.link);
        self.power.unconfigure_port();
    }

    /// Root-complex resume, no-IRQ stage: reconfigure, re-link, restore
    /// volatile state.
    pub fn resume_noirq(&self) -> anyhow::Result<()> {
        if self.power.state() == PowerState::L2 {
            self.power.begin_exit_l2()?;
        }
        self.power
            .configure_port(Mode::RootComplex, true)
            .context("failed to reconfigure controller")?;

        let trained = self.link.bring_up();
        self.enable_rp_interrupts();
        match trained {
            Ok((width, speed)) => self.apply_link_rate(width, speed),
            Err(err) => warn!(error = %err, "link did not come back after resume"),
        }

        self.power.restore_msi_vectors();
        self.power.mark_active();
        Ok(())
    }

    /// Root-complex resume, early stage: disarm hardware hot reset.
    pub fn resume_early(&self) {
        if self.cfg.sbr_reset_workaround {
            self.power.disable_hw_hot_reset_mode();
        }
    }

    fn mark_config_ready(&self) {
        *self.config_ready.lock() = true;
        self.config_ready_cv.notify_all();
    }

    fn wait_config_ready(&self) {
        let mut ready = self.config_ready.lock();
        while !*ready {
            self.config_ready_cv.wait(&mut ready);
        }
    }
}
