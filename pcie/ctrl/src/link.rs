// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Link manager: LTSSM-level bring-up, width/speed tracking, and recovery
//! from known-bad link conditions.
//!
//! Bring-up is a prepare-then-poll sequence. Preparation programs the
//! port-side config space (payload size, decode policy, lane count,
//! equalization presets, ASPM advertisement), pulses PERST around the
//! LTSSM enable, and polling then waits for the data-link layer to report
//! active within a caller-visible budget.
//!
//! One recovery path deserves its exact conditional: some link partners
//! cannot train when the port advertises the Data Link Feature exchange.
//! That failure has a precise signature — the LTSSM parked in the
//! data-link wait state with the link not reported up. Only on that
//! signature is DLF disabled and bring-up retried, exactly once; any
//! other failure is surfaced as link-down, because disabling DLF changes
//! negotiated behavior and must not be applied to an ordinary dead link.

use crate::config::ControllerConfig;
use crate::platform::ApplWindow;
use crate::platform::CoreClock;
use crate::platform::DbiWindow;
use crate::platform::ResetLine;
use crate::poll::poll_until_budgeted;
use parking_lot::Mutex;
use pcie_ctrl_regs::LinkSpeed;
use pcie_ctrl_regs::appl::ApplReg;
use pcie_ctrl_regs::appl::LtssmState;
use pcie_ctrl_regs::appl;
use pcie_ctrl_regs::dbi::DbiReg;
use pcie_ctrl_regs::dbi;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use tracing::warn;

/// Externally observable link state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// No link and no training in progress.
    Down,
    /// LTSSM enabled, waiting for the data-link layer.
    Training,
    /// Link trained at the given width and speed.
    Up {
        /// Negotiated lane count.
        width: u8,
        /// Negotiated speed.
        speed: LinkSpeed,
    },
    /// Retraining after disabling the Data Link Feature exchange.
    RetryWithDlfDisabled,
}

/// An error bringing the link up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    /// The data-link layer did not report active within the budget.
    #[error("link training timed out")]
    Timeout,
}

/// Drives LTSSM-level bring-up and link recovery for one port.
pub struct LinkManager {
    appl: ApplWindow,
    dbi: DbiWindow,
    core_rst: Arc<dyn ResetLine>,
    core_clock: Arc<dyn CoreClock>,
    cfg: Arc<ControllerConfig>,
    state: Mutex<LinkState>,
    init_link_width: AtomicU8,
}

impl LinkManager {
    /// Creates the link manager for one port.
    pub fn new(
        appl: ApplWindow,
        dbi: DbiWindow,
        core_rst: Arc<dyn ResetLine>,
        core_clock: Arc<dyn CoreClock>,
        cfg: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            appl,
            dbi,
            core_rst,
            core_clock,
            cfg,
            state: Mutex::new(LinkState::Down),
            init_link_width: AtomicU8::new(0),
        }
    }

    /// The current link state.
    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Whether the data-link layer currently reports active.
    pub fn current_link_up(&self) -> bool {
        self.dbi.link_status().data_link_layer_active()
    }

    /// The negotiated (width, speed) pair, when the link is up.
    pub fn negotiated(&self) -> Option<(u8, LinkSpeed)> {
        let status = self.dbi.link_status();
        if !status.data_link_layer_active() {
            return None;
        }
        let speed = LinkSpeed::from_field(status.current_link_speed())?;
        Some((status.negotiated_link_width() as u8, speed))
    }

    /// The lane width recorded at initial bring-up.
    pub fn initial_width(&self) -> u8 {
        self.init_link_width.load(Ordering::Relaxed)
    }

    /// Full bring-up: prepare, train, and fall back to a DLF-disabled
    /// retry on the one failure signature that calls for it.
    pub fn bring_up(&self) -> Result<(u8, LinkSpeed), LinkError> {
        let mut budget = self.cfg.timeouts.link_up_budget;
        self.start_link();

        match self.wait_for_link_up(&mut budget) {
            Ok(up) => return Ok(self.finish_bring_up(up)),
            Err(LinkError::Timeout) => {}
        }

        // Some endpoints cannot train against a port with the Data Link
        // Feature exchange enabled. Retry with DLF disabled only when the
        // LTSSM is demonstrably parked in the data-link wait state; any
        // other signature means the link is down for ordinary reasons.
        let ltssm = appl::Debug::from_bits(self.appl.read(ApplReg::DEBUG)).ltssm_state();
        let rdlh_up = appl::LinkStatus::from_bits(self.appl.read(ApplReg::LINK_STATUS))
            .rdlh_link_up();
        if !(ltssm == LtssmState::DL_WAIT && !rdlh_up) {
            *self.state.lock() = LinkState::Down;
            return Err(LinkError::Timeout);
        }

        info!("link is down in DLL, retrying with DLF disabled");
        *self.state.lock() = LinkState::RetryWithDlfDisabled;

        self.appl.update(ApplReg::CTRL, |v| {
            appl::Ctrl::from_bits(v).with_ltssm_enable(false).into_bits()
        });
        self.core_rst.assert().unwrap_or_else(|err| {
            warn!(error = %err, "core reset assert failed during DLF fallback")
        });
        self.core_rst.deassert().unwrap_or_else(|err| {
            warn!(error = %err, "core reset deassert failed during DLF fallback")
        });
        self.dbi.update(DbiReg::DLF_CAP, |v| {
            dbi::DlfCap::from_bits(v).with_exchange_enable(false).into_bits()
        });

        self.start_link();
        loop {
            match self.wait_for_link_up(&mut budget) {
                Ok(up) => return Ok(self.finish_bring_up(up)),
                Err(LinkError::Timeout) if !budget.is_zero() => {
                    info!(remaining = ?budget, "link-up budget remains, waiting again");
                }
                Err(err) => {
                    *self.state.lock() = LinkState::Down;
                    return Err(err);
                }
            }
        }
    }

    /// Prepares the port and enables LTSSM. Non-blocking beyond the fixed
    /// PERST delays; completion is observed via [`Self::wait_for_link_up`].
    pub fn start_link(&self) {
        self.prepare_port();

        // Assert RST, enable LTSSM under reset, then release.
        self.appl.update(ApplReg::PINMUX, |v| {
            appl::Pinmux::from_bits(v).with_pex_rst(false).into_bits()
        });
        std::thread::sleep(self.cfg.timeouts.perst_pulse);

        self.appl.update(ApplReg::CTRL, |v| {
            appl::Ctrl::from_bits(v).with_ltssm_enable(true).into_bits()
        });

        self.appl.update(ApplReg::PINMUX, |v| {
            appl::Pinmux::from_bits(v).with_pex_rst(true).into_bits()
        });
        std::thread::sleep(self.cfg.timeouts.perst_settle);

        *self.state.lock() = LinkState::Training;
    }

    /// Polls for the data-link layer to report active, charging the
    /// elapsed time against `budget`. One call polls at most one attempt
    /// slice so a multi-attempt bring-up shares one overall deadline.
    pub fn wait_for_link_up(&self, budget: &mut Duration) -> Result<(u8, LinkSpeed), LinkError> {
        let attempt = (*budget).min(self.cfg.timeouts.link_up_attempt);
        let mut remaining = attempt;
        let result = poll_until_budgeted(
            || self.current_link_up(),
            self.cfg.timeouts.link_poll_interval,
            &mut remaining,
        );
        *budget = budget.saturating_sub(attempt.saturating_sub(remaining));

        match result {
            Ok(()) => {
                let (width, speed) = self.negotiated().ok_or(LinkError::Timeout)?;
                Ok((width, speed))
            }
            Err(_) => Err(LinkError::Timeout),
        }
    }

    fn finish_bring_up(&self, (width, speed): (u8, LinkSpeed)) -> (u8, LinkSpeed) {
        info!(width, speed = speed.0, "link is up");
        self.init_link_width.store(width, Ordering::Relaxed);
        *self.state.lock() = LinkState::Up { width, speed };
        (width, speed)
    }

    /// Arms link-bandwidth-management notifications.
    pub fn enable_bandwidth_notifications(&self) {
        self.dbi
            .update_link_control(|c| c.with_lbm_interrupt_enable(true));
    }

    /// Recovery for a link that autonomously downgraded its width: if
    /// narrower than at bring-up, force Gen-1 and request retraining.
    ///
    /// This link is not stable anyway, so the retrain is fired without
    /// waiting for confirmation.
    pub fn apply_bad_link_workaround(&self) {
        let status = self.dbi.link_status();
        if !status.link_bandwidth_management_status() {
            return;
        }
        let current_width = status.negotiated_link_width() as u8;
        if self.initial_width() > current_width {
            warn!(
                initial = self.initial_width(),
                current = current_width,
                "link is bad, width reduced"
            );
            self.dbi.update(DbiReg::EXP_LNKCTL2_LNKSTA2, |v| {
                let ctl2 = dbi::LinkControl2::from_bits(v as u16)
                    .with_target_link_speed(LinkSpeed::GEN1.0 as u16);
                (v & !0xFFFF) | ctl2.into_bits() as u32
            });
            self.dbi.update_link_control(|c| c.with_retrain_link(true));
        }
    }

    /// Acknowledges a bandwidth-management interrupt: write-1-clears the
    /// LBMS latch and reports the current speed for the deferred
    /// clock-rate change.
    pub fn acknowledge_bandwidth_change(&self) -> Option<LinkSpeed> {
        self.dbi
            .update_link_status(|s| s.with_link_bandwidth_management_status(true));
        LinkSpeed::from_field(self.dbi.link_status().current_link_speed())
    }

    /// Secondary-bus-reset / surprise-link-down workaround: pulse the
    /// core-reset override and request a speed change.
    pub fn apply_sbr_workaround(&self) {
        self.appl.update(ApplReg::CAR_RESET_OVRD, |v| {
            appl::CarResetOvrd::from_bits(v)
                .with_cya_override_core_rst_n(false)
                .into_bits()
        });
        std::thread::sleep(Duration::from_micros(1));
        self.appl.update(ApplReg::CAR_RESET_OVRD, |v| {
            appl::CarResetOvrd::from_bits(v)
                .with_cya_override_core_rst_n(true)
                .into_bits()
        });

        self.dbi.update(DbiReg::LINK_WIDTH_SPEED_CONTROL, |v| {
            dbi::LinkWidthSpeedControl::from_bits(v)
                .with_speed_change(true)
                .into_bits()
        });
    }

    /// Marks the link down after teardown or surprise removal.
    pub fn mark_down(&self) {
        *self.state.lock() = LinkState::Down;
    }

    /// Programs the port-side config space for bring-up. Shared by the
    /// root-complex path and the endpoint PERST-deassert path.
    pub fn prepare_port(&self) {
        // 256-byte max payload.
        self.dbi.update(DbiReg::EXP_DEVCTL_DEVSTA, |v| {
            let ctl = dbi::DeviceControl::from_bits(v as u16)
                .with_max_payload_size(dbi::PAYLOAD_256B);
            (v & !0xFFFF) | ctl.into_bits() as u32
        });

        // No IO decode; enable prefetchable memory decode.
        self.dbi.update(DbiReg::IO_BASE, |v| v & !(1 | 1 << 8));
        self.dbi
            .update(DbiReg::PREF_MEMORY_BASE, |v| v | 1 | 1 << 16);
        self.dbi.write(DbiReg::BAR0, 0);

        // Respond to config retries with the 0xFFFF0001 encoding.
        self.dbi.update(DbiReg::AMBA_ERROR_RESPONSE_DEFAULT, |v| {
            dbi::AmbaErrorResponse::from_bits(v)
                .with_crs(dbi::CrsResponse::OKAY_FFFF0001)
                .into_bits()
        });

        // Advertise the wired lane count and the configured target speed.
        self.dbi.update(DbiReg::EXP_LNKCAP, |v| {
            dbi::LinkCapabilities::from_bits(v)
                .with_max_link_width(self.cfg.num_lanes as u32)
                .into_bits()
        });
        self.dbi.update(DbiReg::EXP_LNKCTL2_LNKSTA2, |v| {
            let ctl2 = dbi::LinkControl2::from_bits(v as u16)
                .with_target_link_speed(self.cfg.target_speed.0 as u16);
            (v & !0xFFFF) | ctl2.into_bits() as u32
        });

        // Separate-refclk configurations must not claim a common slot
        // clock.
        if self.cfg.enable_srns {
            self.dbi
                .update_link_status(|s| s.with_slot_clock_config(false));
        }

        self.config_eq_presets();
        self.apply_aspm_policy();

        // The receiver impedance check misfires on L1 substate exit.
        self.dbi.update(DbiReg::GEN3_RELATED, |v| {
            dbi::Gen3Related::from_bits(v).with_zrxdc_noncompl(false).into_bits()
        });

        // Training may settle on any speed, so run the core at the Gen4
        // rate until negotiation finishes.
        if let Err(err) = self
            .core_clock
            .set_rate(crate::config::core_clock_rate(LinkSpeed::GEN4))
        {
            warn!(error = %err, "failed to raise core clock for training");
        }
    }

    /// Programs the port-side config space for endpoint operation. Like
    /// [`Self::prepare_port`] minus the bridge-only decode registers,
    /// plus clearing the direct speed-change trigger (the host drives
    /// training).
    pub fn prepare_endpoint(&self) {
        self.dbi.update(DbiReg::LINK_WIDTH_SPEED_CONTROL, |v| {
            dbi::LinkWidthSpeedControl::from_bits(v)
                .with_speed_change(false)
                .into_bits()
        });

        self.dbi.update(DbiReg::EXP_DEVCTL_DEVSTA, |v| {
            let ctl = dbi::DeviceControl::from_bits(v as u16)
                .with_max_payload_size(dbi::PAYLOAD_256B);
            (v & !0xFFFF) | ctl.into_bits() as u32
        });

        self.dbi.update(DbiReg::EXP_LNKCTL2_LNKSTA2, |v| {
            let ctl2 = dbi::LinkControl2::from_bits(v as u16)
                .with_target_link_speed(self.cfg.target_speed.0 as u16);
            (v & !0xFFFF) | ctl2.into_bits() as u32
        });

        if self.cfg.enable_srns {
            self.dbi
                .update_link_status(|s| s.with_slot_clock_config(false));
        }

        self.config_eq_presets();
        self.apply_aspm_policy();

        self.dbi.update(DbiReg::GEN3_RELATED, |v| {
            dbi::Gen3Related::from_bits(v).with_zrxdc_noncompl(false).into_bits()
        });

        if let Err(err) = self
            .core_clock
            .set_rate(crate::config::core_clock_rate(LinkSpeed::GEN4))
        {
            warn!(error = %err, "failed to raise core clock for training");
        }
    }

    fn config_eq_presets(&self) {
        const PRESET_INIT: u8 = 5;

        // Per-lane presets: Gen3 in the secondary-PCIe capability
        // (half-word per lane), Gen4 in the 16GT/s capability (byte per
        // lane).
        for lane in 0..self.cfg.num_lanes as u32 {
            let reg = DbiReg(DbiReg::SPCIE_CAP.0 + (lane / 2) * 4);
            let shift = (lane % 2) * 16;
            self.dbi.update(reg, |v| {
                let half = dbi::SpcieLaneCtl::from_bits((v >> shift) as u16)
                    .with_dsp_tx_preset0(PRESET_INIT)
                    .with_usp_tx_preset0(PRESET_INIT);
                (v & !(0xFFFF << shift)) | (half.into_bits() as u32) << shift
            });

            let reg = DbiReg(DbiReg::PL16G_LE_CTRL.0 + (lane / 4) * 4);
            let shift = (lane % 4) * 8;
            let byte = (PRESET_INIT | PRESET_INIT << 4) as u32;
            self.dbi
                .update(reg, |v| (v & !(0xFF << shift)) | byte << shift);
        }

        // Request vector for Gen3 rate...
        self.dbi.update(DbiReg::GEN3_RELATED, |v| {
            dbi::Gen3Related::from_bits(v).with_rate_shadow_sel(0).into_bits()
        });
        self.dbi.update(DbiReg::GEN3_EQ_CONTROL, |v| {
            dbi::Gen3EqControl::from_bits(v)
                .with_pset_req_vec(0x3FF)
                .with_fb_mode(0)
                .into_bits()
        });

        // ...and for the Gen4 rate behind the shadow selector.
        self.dbi.update(DbiReg::GEN3_RELATED, |v| {
            dbi::Gen3Related::from_bits(v).with_rate_shadow_sel(1).into_bits()
        });
        self.dbi.update(DbiReg::GEN3_EQ_CONTROL, |v| {
            dbi::Gen3EqControl::from_bits(v)
                .with_pset_req_vec(self.cfg.gen4_preset_request_vector as u32)
                .with_fb_mode(0)
                .into_bits()
        });
        self.dbi.update(DbiReg::GEN3_RELATED, |v| {
            dbi::Gen3Related::from_bits(v).with_rate_shadow_sel(0).into_bits()
        });
    }

    fn apply_aspm_policy(&self) {
        let disabled = self.cfg.disabled_aspm;

        // L1 substates need CLKREQ# routed to the slot.
        if !self.cfg.supports_clkreq || disabled.l1 || disabled.l1_1 {
            self.disable_l1ss(|c| c.with_aspm_l1_1(false));
        }
        if !self.cfg.supports_clkreq || disabled.l1 || disabled.l1_2 {
            self.disable_l1ss(|c| c.with_aspm_l1_2(false));
        }

        if disabled.l0s {
            self.dbi.update(DbiReg::EXP_LNKCAP, |v| {
                let cap = dbi::LinkCapabilities::from_bits(v);
                let aspm = cap.aspm_support() & !0b01;
                cap.with_aspm_support(aspm).into_bits()
            });
        }
        if disabled.l1 {
            self.dbi.update(DbiReg::EXP_LNKCAP, |v| {
                let cap = dbi::LinkCapabilities::from_bits(v);
                let aspm = cap.aspm_support() & !0b10;
                cap.with_aspm_support(aspm).into_bits()
            });
        }
    }

    fn disable_l1ss(&self, f: impl FnOnce(dbi::L1ssCap) -> dbi::L1ssCap) {
        self.dbi.update(DbiReg::L1SS_CAP, |v| {
            f(dbi::L1ssCap::from_bits(v)).into_bits()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceId;
    use crate::test_helpers::TestClock;
    use crate::test_helpers::TestRegisterBank;
    use crate::test_helpers::TestResetLine;
    use crate::test_helpers::fast_timeouts;
    use crate::test_helpers::script_link_up;
    use std::time::Instant;

    struct LinkFixture {
        appl: Arc<TestRegisterBank>,
        dbi: Arc<TestRegisterBank>,
        core_rst: Arc<TestResetLine>,
        clock: Arc<TestClock>,
        link: LinkManager,
    }

    fn fixture_with(cfg: ControllerConfig) -> LinkFixture {
        let appl = Arc::new(TestRegisterBank::new());
        let dbi = Arc::new(TestRegisterBank::new());
        let core_rst = Arc::new(TestResetLine::default());
        let clock = Arc::new(TestClock::default());
        let link = LinkManager::new(
            ApplWindow::new(appl.clone()),
            DbiWindow::new(dbi.clone()),
            core_rst.clone(),
            clock.clone(),
            Arc::new(cfg),
        );
        LinkFixture {
            appl,
            dbi,
            core_rst,
            clock,
            link,
        }
    }

    fn fixture() -> LinkFixture {
        let mut cfg = ControllerConfig::new(InstanceId::Ctl5, 4);
        cfg.timeouts = fast_timeouts();
        fixture_with(cfg)
    }

    #[test]
    fn first_try_bring_up_at_gen3_x4() {
        let f = fixture();
        script_link_up(&f.appl, &f.dbi, 4, 3);

        let (width, speed) = f.link.bring_up().unwrap();
        assert_eq!((width, speed), (4, LinkSpeed::GEN3));
        assert_eq!(
            f.link.state(),
            LinkState::Up {
                width: 4,
                speed: LinkSpeed::GEN3
            }
        );
        assert_eq!(f.link.initial_width(), 4);
        // No DLF fallback: the core reset was never cycled.
        assert_eq!(f.core_rst.assert_count.load(Ordering::Relaxed), 0);
        // Training ran with the core clock at the Gen4 rate.
        assert_eq!(f.clock.last_rate(), Some(500_000_000));

        // The prepare sequence advertised the wired lane count.
        let cap = dbi::LinkCapabilities::from_bits(f.dbi.peek(DbiReg::EXP_LNKCAP.0));
        assert_eq!(cap.max_link_width(), 4);
    }

    #[test]
    fn dlf_fallback_retries_exactly_once() {
        let f = fixture();

        // First training attempt parks the LTSSM in the data-link wait
        // state; once DLF is disabled, training succeeds at Gen1 x1.
        let dbi = f.dbi.clone();
        f.appl.on_write(move |bank, offset, value| {
            if offset == ApplReg::CTRL.0 && value & 1 << 7 != 0 {
                let dlf = dbi::DlfCap::from_bits(dbi.peek(DbiReg::DLF_CAP.0));
                if dlf.exchange_enable() {
                    bank.poke(
                        ApplReg::DEBUG.0,
                        appl::Debug::new()
                            .with_ltssm_state(LtssmState::DL_WAIT)
                            .into_bits(),
                    );
                } else {
                    bank.poke_bits(ApplReg::LINK_STATUS.0, 1);
                    let status = dbi::LinkStatus::new()
                        .with_current_link_speed(1)
                        .with_negotiated_link_width(1)
                        .with_data_link_layer_active(true);
                    dbi.poke(
                        DbiReg::EXP_LNKCTL_LNKSTA.0,
                        (status.into_bits() as u32) << 16,
                    );
                }
            }
        });
        // DLF starts out advertised.
        f.dbi
            .poke(DbiReg::DLF_CAP.0, dbi::DlfCap::new().with_exchange_enable(true).into_bits());

        let (width, speed) = f.link.bring_up().unwrap();
        assert_eq!((width, speed), (1, LinkSpeed::GEN1));

        // Exactly one core reset cycle, and DLF is no longer advertised.
        assert_eq!(f.core_rst.assert_count.load(Ordering::Relaxed), 1);
        assert_eq!(f.core_rst.deassert_count.load(Ordering::Relaxed), 1);
        let dlf = dbi::DlfCap::from_bits(f.dbi.peek(DbiReg::DLF_CAP.0));
        assert!(!dlf.exchange_enable());
        assert_eq!(
            f.link.state(),
            LinkState::Up {
                width: 1,
                speed: LinkSpeed::GEN1
            }
        );
    }

    #[test]
    fn ordinary_link_down_does_not_trigger_dlf_fallback() {
        let f = fixture();
        // LTSSM settles in detect: nobody is on the other end.
        f.appl.poke(
            ApplReg::DEBUG.0,
            appl::Debug::new()
                .with_ltssm_state(LtssmState::DETECT_QUIET)
                .into_bits(),
        );

        assert_eq!(f.link.bring_up().unwrap_err(), LinkError::Timeout);
        assert_eq!(f.link.state(), LinkState::Down);
        // The DLF path (reset cycle) must not run.
        assert_eq!(f.core_rst.assert_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn wait_never_exceeds_the_caller_budget() {
        let f = fixture();
        let mut budget = Duration::from_millis(40);
        let start = Instant::now();
        assert_eq!(
            f.link.wait_for_link_up(&mut budget).unwrap_err(),
            LinkError::Timeout
        );
        // One attempt slice (30ms) is under the budget; the remainder is
        // still available to the caller.
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(budget <= Duration::from_millis(40));

        let mut budget = Duration::ZERO;
        let start = Instant::now();
        assert!(f.link.wait_for_link_up(&mut budget).is_err());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn bad_link_workaround_forces_gen1_when_width_shrank() {
        let f = fixture();
        script_link_up(&f.appl, &f.dbi, 4, 3);
        f.link.bring_up().unwrap();

        // The link autonomously downgraded to x2 with LBMS latched.
        let status = dbi::LinkStatus::new()
            .with_current_link_speed(3)
            .with_negotiated_link_width(2)
            .with_data_link_layer_active(true)
            .with_link_bandwidth_management_status(true);
        f.dbi.poke(
            DbiReg::EXP_LNKCTL_LNKSTA.0,
            (status.into_bits() as u32) << 16,
        );

        f.link.apply_bad_link_workaround();

        let ctl2 = dbi::LinkControl2::from_bits(f.dbi.peek(DbiReg::EXP_LNKCTL2_LNKSTA2.0) as u16);
        assert_eq!(ctl2.target_link_speed(), 1);
        let ctl = dbi::LinkControl::from_bits(f.dbi.peek(DbiReg::EXP_LNKCTL_LNKSTA.0) as u16);
        assert!(ctl.retrain_link());
    }

    #[test]
    fn bad_link_workaround_ignores_equal_width() {
        let f = fixture();
        script_link_up(&f.appl, &f.dbi, 2, 2);
        f.link.bring_up().unwrap();

        let status = dbi::LinkStatus::new()
            .with_current_link_speed(2)
            .with_negotiated_link_width(2)
            .with_data_link_layer_active(true)
            .with_link_bandwidth_management_status(true);
        f.dbi.poke(
            DbiReg::EXP_LNKCTL_LNKSTA.0,
            (status.into_bits() as u32) << 16,
        );

        f.link.apply_bad_link_workaround();
        let ctl = dbi::LinkControl::from_bits(f.dbi.peek(DbiReg::EXP_LNKCTL_LNKSTA.0) as u16);
        assert!(!ctl.retrain_link());
    }

    #[test]
    fn aspm_l1ss_suppressed_without_clkreq() {
        let f = fixture();
        f.dbi.poke(
            DbiReg::L1SS_CAP.0,
            dbi::L1ssCap::new()
                .with_aspm_l1_1(true)
                .with_aspm_l1_2(true)
                .with_l1ss_supported(true)
                .into_bits(),
        );
        f.link.prepare_port();

        let cap = dbi::L1ssCap::from_bits(f.dbi.peek(DbiReg::L1SS_CAP.0));
        assert!(!cap.aspm_l1_1());
        assert!(!cap.aspm_l1_2());
        assert!(cap.l1ss_supported());
    }
}
