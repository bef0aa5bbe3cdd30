// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Power state controller: Active ↔ L2 sequencing, controller
//! configuration/deconfiguration, and hot reset.
//!
//! L2 entry is the one-way door of this module: after the reference
//! clock is gated and the CLKREQ override is asserted, no register access
//! on the bus-core window is valid until the port is reconfigured. The
//! sequencing is therefore strict — fault interrupts are disabled before
//! the PME turnoff handshake (a fault report halfway through the
//! transition would be serviced against a dying port), and the PERST
//! fallback only runs when the handshake fails.
//!
//! Configuration failures unwind in strict reverse order and propagate:
//! a port that cannot acquire its clocks, resets or PHYs fails attach or
//! resume outright.

use crate::config::ControllerConfig;
use crate::controller::Mode;
use crate::link::LinkManager;
use crate::platform::Platform;
use crate::poll::poll_until;
use parking_lot::Mutex;
use pcie_ctrl_regs::appl::ApplReg;
use pcie_ctrl_regs::appl;
use pcie_ctrl_regs::dbi::DbiReg;
use pcie_ctrl_regs::dbi;
use std::sync::Arc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Power state of the port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PowerState {
    /// The port is configured and (potentially) linked.
    Active,
    /// L2 entry in progress.
    EnteringL2,
    /// The port is in L2 with its reference clock gated.
    L2,
    /// Reconfiguration after L2 in progress.
    ExitingL2,
}

/// Sequences the port between Active and L2 and manages hot reset.
pub struct PowerStateController {
    platform: Arc<Platform>,
    cfg: Arc<ControllerConfig>,
    state: Mutex<PowerState>,
    saved_msi_vectors: Mutex<Option<u32>>,
}

impl PowerStateController {
    /// Creates the controller; the port starts logically active (attach
    /// configures it before anything else runs).
    pub fn new(platform: Arc<Platform>, cfg: Arc<ControllerConfig>) -> Self {
        Self {
            platform,
            cfg,
            state: Mutex::new(PowerState::Active),
            saved_msi_vectors: Mutex::new(None),
        }
    }

    /// The current power state.
    pub fn state(&self) -> PowerState {
        *self.state.lock()
    }

    /// Moves the port into L2 via the PME turnoff handshake, falling back
    /// to a forced PERST when the partner never acknowledges.
    ///
    /// A port whose link is already down has nothing to hand-shake and is
    /// left untouched. Callers must have quiesced interrupt delivery; the
    /// first thing this does is disable every interrupt source, because a
    /// fault report mid-transition would race the teardown.
    pub fn enter_l2(&self, link: &LinkManager) {
        if !link.current_link_up() {
            debug!("link is not up, skipping L2 entry");
            return;
        }

        {
            let mut state = self.state.lock();
            if *state != PowerState::Active {
                error!(state = ?*state, "L2 entry requested while not active");
                return;
            }
            *state = PowerState::EnteringL2;
        }

        let appl = &self.platform.appl;
        appl.write(ApplReg::INTR_EN_L0, 0);

        if self.try_link_l2().is_err() {
            info!("link didn't transition to L2 state");
            // The transmit lane clock only resets in the L2 or detect
            // states, so force PERST to the partner and wait for the
            // LTSSM to fall back to detect.
            appl.update(ApplReg::PINMUX, |v| {
                appl::Pinmux::from_bits(v).with_pex_rst(false).into_bits()
            });

            let settled = poll_until(
                || {
                    appl::Debug::from_bits(appl.read(ApplReg::DEBUG))
                        .ltssm_state()
                        .is_detect()
                },
                self.cfg.timeouts.ltssm_interval,
                self.cfg.timeouts.ltssm,
            );
            if settled.is_err() {
                info!("link didn't go to detect state");
            }

            // Stop the LTSSM from oscillating between polling and
            // detect.
            appl.update(ApplReg::CTRL, |v| {
                appl::Ctrl::from_bits(v).with_ltssm_enable(false).into_bits()
            });
        }

        // Gate REFCLK to the slot and pin CLKREQ. The bus-core window
        // may stop responding after this, depending on how the partner
        // pulls CLKREQ.
        appl.update(ApplReg::PINMUX, |v| {
            appl::Pinmux::from_bits(v)
                .with_clkreq_override_en(true)
                .with_clkreq_override(true)
                .with_clk_output_override_en(true)
                .with_clk_output_override(false)
                .into_bits()
        });

        link.mark_down();
        *self.state.lock() = PowerState::L2;
    }

    fn try_link_l2(&self) -> Result<(), crate::poll::PollTimeout> {
        let appl = &self.platform.appl;
        appl.update(ApplReg::RADM_STATUS, |v| {
            appl::RadmStatus::from_bits(v).with_pm_xmt_turnoff(true).into_bits()
        });
        poll_until(
            || appl::Debug::from_bits(appl.read(ApplReg::DEBUG)).pm_linkst_in_l2_lat(),
            self.cfg.timeouts.pme_ack_interval,
            self.cfg.timeouts.pme_ack,
        )
    }

    /// Begins L2 exit; valid only from L2.
    pub fn begin_exit_l2(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if *state != PowerState::L2 {
            anyhow::bail!("L2 exit requested while {:?}", *state);
        }
        *state = PowerState::ExitingL2;
        Ok(())
    }

    /// Marks the port active after configuration completes.
    pub fn mark_active(&self) {
        *self.state.lock() = PowerState::Active;
    }

    /// Configures the controller: power rails, clocks, resets, PHYs and
    /// the application-window port personality. Failures unwind in
    /// reverse order and propagate.
    pub fn configure_port(&self, mode: Mode, en_hw_hot_rst: bool) -> anyhow::Result<()> {
        use anyhow::Context;

        let p = &self.platform;
        p.port_power
            .set_enabled(true)
            .context("failed to enable controller partition")?;

        let configured = self.configure_rails().and_then(|()| {
            let r = self.configure_core(mode, en_hw_hot_rst);
            if r.is_err() {
                self.unconfigure_rails();
            }
            r
        });
        if configured.is_err() {
            let _ = p.port_power.set_enabled(false);
        }
        configured
    }

    fn configure_rails(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        let p = &self.platform;
        if self.cfg.enable_ext_refclk {
            if let Some(pll) = &p.refclk_pll {
                pll.set_enabled(true).context("failed to sequence refclk PLL up")?;
            }
        }

        let mut enabled_slots = 0;
        for (i, supply) in p.slot_supplies.iter().enumerate() {
            if let Err(err) = supply.enable() {
                for supply in p.slot_supplies[..i].iter().rev() {
                    let _ = supply.disable();
                }
                if self.cfg.enable_ext_refclk {
                    if let Some(pll) = &p.refclk_pll {
                        let _ = pll.set_enabled(false);
                    }
                }
                return Err(err.context("failed to enable slot supply"));
            }
            enabled_slots = i + 1;
        }

        if let Some(supply) = &p.port_supply {
            if let Err(err) = supply.enable() {
                for supply in p.slot_supplies[..enabled_slots].iter().rev() {
                    let _ = supply.disable();
                }
                if self.cfg.enable_ext_refclk {
                    if let Some(pll) = &p.refclk_pll {
                        let _ = pll.set_enabled(false);
                    }
                }
                return Err(err.context("failed to enable port supply"));
            }
        }
        Ok(())
    }

    fn unconfigure_rails(&self) {
        let p = &self.platform;
        if let Some(supply) = &p.port_supply {
            if let Err(err) = supply.disable() {
                error!(error = %err, "failed to disable port supply");
            }
        }
        for supply in p.slot_supplies.iter().rev() {
            let _ = supply.disable();
        }
        if self.cfg.enable_ext_refclk {
            if let Some(pll) = &p.refclk_pll {
                if let Err(err) = pll.set_enabled(false) {
                    error!(error = %err, "failed to sequence refclk PLL down");
                }
            }
        }
    }

    fn configure_core(&self, mode: Mode, en_hw_hot_rst: bool) -> anyhow::Result<()> {
        use anyhow::Context;

        let p = &self.platform;
        p.core_clock.enable().context("failed to enable core clock")?;

        if let Err(err) = p.core_apb_rst.deassert() {
            p.core_clock.disable();
            return Err(err.context("failed to deassert core APB reset"));
        }

        if let Err(err) = self.configure_phys_and_registers(mode, en_hw_hot_rst) {
            let _ = p.core_apb_rst.assert();
            p.core_clock.disable();
            return Err(err);
        }
        Ok(())
    }

    fn configure_phys_and_registers(&self, mode: Mode, en_hw_hot_rst: bool) -> anyhow::Result<()> {
        let p = &self.platform;
        let appl = &p.appl;

        if en_hw_hot_rst || !self.cfg.sbr_reset_workaround {
            appl.update(ApplReg::CTRL, |v| {
                appl::Ctrl::from_bits(v)
                    .with_hot_rst_mode(appl::HotRstMode::IMMEDIATE_RST_LTSSM_EN)
                    .with_hw_hot_rst_enable(true)
                    .into_bits()
            });
        }

        for (i, phy) in p.phys.iter().enumerate() {
            let powered = phy
                .init()
                .and_then(|()| phy.power_on())
                .and_then(|()| phy.calibrate());
            if let Err(err) = powered {
                for phy in p.phys[..=i].iter().rev() {
                    phy.power_off();
                    phy.exit();
                }
                return Err(err.context(format!("failed to enable PHY lane {i}")));
            }
        }

        appl.write(
            ApplReg::CFG_BASE_ADDR,
            (p.cfg_base_addr as u32) & 0xFFFF_F000,
        );

        let dm_type = match mode {
            Mode::RootComplex => appl::DmTypeValue::ROOT_PORT,
            Mode::Endpoint => appl::DmTypeValue::ENDPOINT,
        };
        appl.write(
            ApplReg::DM_TYPE,
            appl::DmType::new().with_dm_type(dm_type).into_bits(),
        );

        appl.write(ApplReg::CFG_SLCG_OVERRIDE, 0);

        appl.update(ApplReg::CTRL, |v| {
            appl::Ctrl::from_bits(v).with_sys_pre_det_state(true).into_bits()
        });

        appl.update(ApplReg::CFG_MISC, |v| {
            let misc = appl::CfgMisc::from_bits(v)
                .with_arcache(appl::CFG_MISC_ARCACHE_VAL)
                .with_slv_ep_mode(mode == Mode::Endpoint);
            misc.into_bits()
        });

        match mode {
            Mode::RootComplex => {
                if self.cfg.enable_srns || self.cfg.enable_ext_refclk {
                    // The port cannot loop an external or separate clock
                    // back to the partner, so gate the REFCLK out pads.
                    appl.update(ApplReg::PINMUX, |v| {
                        appl::Pinmux::from_bits(v)
                            .with_clk_output_override_en(true)
                            .with_clk_output_override(false)
                            .into_bits()
                    });
                }
                if !self.cfg.supports_clkreq {
                    appl.update(ApplReg::PINMUX, |v| {
                        appl::Pinmux::from_bits(v)
                            .with_clkreq_override_en(true)
                            .with_clkreq_override(false)
                            .with_clkreq_default_value(false)
                            .into_bits()
                    });
                }
            }
            Mode::Endpoint => {
                appl.update(ApplReg::PINMUX, |v| {
                    appl::Pinmux::from_bits(v)
                        .with_clk_output_override_en(true)
                        .with_clk_output_override(true)
                        .into_bits()
                });
            }
        }

        appl.write(
            ApplReg::CFG_IATU_DMA_BASE_ADDR,
            (p.iatu_dma_base_addr as u32) & 0xFFFF_C000,
        );

        if let Err(err) = p.core_rst.deassert() {
            for phy in p.phys.iter().rev() {
                phy.power_off();
                phy.exit();
            }
            return Err(err.context("failed to deassert core reset"));
        }
        Ok(())
    }

    /// Deconfigures the controller. No register access is valid
    /// afterwards.
    pub fn unconfigure_port(&self) {
        let p = &self.platform;
        if let Err(err) = p.core_rst.assert() {
            error!(error = %err, "failed to assert core reset");
        }
        for phy in p.phys.iter().rev() {
            phy.power_off();
            phy.exit();
        }
        if let Err(err) = p.core_apb_rst.assert() {
            error!(error = %err, "failed to assert core APB reset");
        }
        p.core_clock.disable();
        self.unconfigure_rails();
        if let Err(err) = p.port_power.set_enabled(false) {
            error!(error = %err, "failed to disable controller partition");
        }
    }

    /// Disables error reporting ahead of teardown, so a surprise-down
    /// error cannot race the deconfiguration.
    pub fn teardown_reporting(&self) {
        let p = &self.platform;
        p.appl.update(ApplReg::INTR_EN_L1_8, |v| {
            appl::IntrEnL1_8::from_bits(v).with_aer(false).into_bits()
        });

        p.dbi.update(DbiReg::COMMAND, |v| {
            dbi::Command::from_bits(v).with_serr_enable(false).into_bits()
        });

        p.dbi.update(DbiReg::EXP_DEVCTL_DEVSTA, |v| {
            let ctl = dbi::DeviceControl::from_bits(v as u16)
                .with_correctable_error_reporting_enable(false)
                .with_non_fatal_error_reporting_enable(false)
                .with_fatal_error_reporting_enable(false)
                .with_unsupported_request_reporting_enable(false);
            (v & !0xFFFF) | ctl.into_bits() as u32
        });

        // Write-1-clear whatever root error status is latched.
        let status = p.dbi.read(DbiReg::AER_ROOT_ERR_STATUS);
        p.dbi.write(DbiReg::AER_ROOT_ERR_STATUS, status);
    }

    /// Services a hot-reset-done condition: blanket-clears every latched
    /// status group and re-enables LTSSM.
    ///
    /// This is the only blanket clear in the driver — a hot reset
    /// invalidates all previously-latched status, whereas the fault paths
    /// must only ever clear their own bits.
    pub fn hot_reset_done(&self) {
        let appl = &self.platform.appl;
        for &group in appl::STATUS_GROUPS {
            appl.write(group, 0xFFFF_FFFF);
        }
        appl.write(ApplReg::MSI_CTRL_2, 0xFFFF_FFFF);

        appl.update(ApplReg::CTRL, |v| {
            appl::Ctrl::from_bits(v).with_ltssm_enable(true).into_bits()
        });
    }

    /// Arms hardware hot-reset handling for the suspend window.
    pub fn enable_hw_hot_reset_mode(&self) {
        self.platform.appl.update(ApplReg::CTRL, |v| {
            appl::Ctrl::from_bits(v)
                .with_hot_rst_mode(appl::HotRstMode(0))
                .with_hw_hot_rst_enable(true)
                .into_bits()
        });
    }

    /// Disarms hardware hot-reset handling after resume.
    pub fn disable_hw_hot_reset_mode(&self) {
        self.platform.appl.update(ApplReg::CTRL, |v| {
            appl::Ctrl::from_bits(v)
                .with_hot_rst_mode(appl::HotRstMode::IMMEDIATE_RST)
                .with_hw_hot_rst_enable(false)
                .into_bits()
        });
    }

    /// Saves the MSI vector-enable state ahead of losing the bus-core
    /// window.
    pub fn save_msi_vectors(&self) {
        let value = self.platform.dbi.read(DbiReg::MSI_CTRL_INT_0_EN);
        *self.saved_msi_vectors.lock() = Some(value);
    }

    /// Restores the MSI vector-enable state after reconfiguration.
    pub fn restore_msi_vectors(&self) {
        if let Some(value) = self.saved_msi_vectors.lock().take() {
            self.platform.dbi.write(DbiReg::MSI_CTRL_INT_0_EN, value);
        } else {
            warn!("no saved MSI vector state to restore");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceId;
    use crate::link::LinkManager;
    use crate::platform::ApplWindow;
    use crate::platform::DbiWindow;
    use crate::test_helpers::fast_timeouts;
    use crate::test_helpers::test_platform;
    use std::sync::atomic::Ordering;

    struct PowerFixture {
        handles: crate::test_helpers::TestPlatformHandles,
        power: PowerStateController,
        link: LinkManager,
    }

    fn fixture() -> PowerFixture {
        let (platform, handles) = test_platform(2, false);
        let mut cfg = ControllerConfig::new(InstanceId::Ctl1, 2);
        cfg.timeouts = fast_timeouts();
        let cfg = Arc::new(cfg);
        let power = PowerStateController::new(platform, cfg.clone());
        let link = LinkManager::new(
            ApplWindow::new(handles.appl.clone()),
            DbiWindow::new(handles.dbi.clone()),
            handles.core_rst.clone(),
            handles.core_clock.clone(),
            cfg,
        );
        PowerFixture {
            handles,
            power,
            link,
        }
    }

    fn make_link_up(f: &PowerFixture) {
        let status = dbi::LinkStatus::new()
            .with_current_link_speed(3)
            .with_negotiated_link_width(2)
            .with_data_link_layer_active(true);
        f.handles.dbi.poke(
            DbiReg::EXP_LNKCTL_LNKSTA.0,
            (status.into_bits() as u32) << 16,
        );
    }

    #[test]
    fn enter_l2_with_link_down_is_a_register_level_noop() {
        let f = fixture();
        let writes_before = f.handles.appl.write_count() + f.handles.dbi.write_count();

        f.power.enter_l2(&f.link);

        assert_eq!(f.power.state(), PowerState::Active);
        assert_eq!(
            f.handles.appl.write_count() + f.handles.dbi.write_count(),
            writes_before,
            "no register writes may be issued when the link is already down"
        );
    }

    #[test]
    fn enter_l2_happy_path_uses_pme_turnoff() {
        let f = fixture();
        make_link_up(&f);
        // Arm interrupts so the test can observe them being cut.
        f.handles.appl.poke(ApplReg::INTR_EN_L0.0, 0xFFFF_FFFF);
        // The partner acknowledges the turnoff message.
        f.handles.appl.on_write(|bank, offset, value| {
            if offset == ApplReg::RADM_STATUS.0 && value & 1 != 0 {
                bank.poke(
                    ApplReg::DEBUG.0,
                    appl::Debug::new().with_pm_linkst_in_l2_lat(true).into_bits(),
                );
            }
        });

        f.power.enter_l2(&f.link);

        assert_eq!(f.power.state(), PowerState::L2);
        // All interrupt sources were cut before the handshake.
        assert_eq!(f.handles.appl.peek(ApplReg::INTR_EN_L0.0), 0);
        // REFCLK gated, CLKREQ overridden.
        let pinmux = appl::Pinmux::from_bits(f.handles.appl.peek(ApplReg::PINMUX.0));
        assert!(pinmux.clkreq_override_en());
        assert!(pinmux.clkreq_override());
        assert!(pinmux.clk_output_override_en());
        assert!(!pinmux.clk_output_override());
        // The handshake succeeded, so the PERST/LTSSM fallback never ran:
        // no write touched the control register.
        assert!(
            !f.handles
                .appl
                .write_log()
                .iter()
                .any(|&(offset, _)| offset == ApplReg::CTRL.0)
        );
    }

    #[test]
    fn enter_l2_falls_back_to_perst_when_pme_times_out() {
        let f = fixture();
        make_link_up(&f);
        // Never acknowledge the turnoff; settle into detect once PERST
        // is forced low.
        f.handles.appl.on_write(|bank, offset, value| {
            if offset == ApplReg::PINMUX.0 && value & 1 == 0 {
                bank.poke(
                    ApplReg::DEBUG.0,
                    appl::Debug::new()
                        .with_ltssm_state(appl::LtssmState::DETECT_QUIET)
                        .into_bits(),
                );
            }
        });

        f.power.enter_l2(&f.link);

        assert_eq!(f.power.state(), PowerState::L2);
        // The fallback disabled LTSSM to stop the detect/polling
        // oscillation.
        let ctrl = appl::Ctrl::from_bits(f.handles.appl.peek(ApplReg::CTRL.0));
        assert!(!ctrl.ltssm_enable());
    }

    #[test]
    fn enter_l2_rejects_invalid_transitions() {
        let f = fixture();
        make_link_up(&f);
        f.handles.appl.on_write(|bank, offset, value| {
            if offset == ApplReg::RADM_STATUS.0 && value & 1 != 0 {
                bank.poke(
                    ApplReg::DEBUG.0,
                    appl::Debug::new().with_pm_linkst_in_l2_lat(true).into_bits(),
                );
            }
        });
        f.power.enter_l2(&f.link);
        assert_eq!(f.power.state(), PowerState::L2);

        // A second entry attempt is rejected: the state machine only
        // accepts EnteringL2 from Active.
        make_link_up(&f);
        let writes_before = f.handles.appl.write_count();
        f.power.enter_l2(&f.link);
        assert_eq!(f.power.state(), PowerState::L2);
        assert_eq!(f.handles.appl.write_count(), writes_before);
    }

    #[test]
    fn configure_port_programs_the_application_window() {
        let f = fixture();
        f.power.configure_port(Mode::RootComplex, false).unwrap();

        assert!(f.handles.port_power.enabled.load(Ordering::Relaxed));
        assert!(f.handles.core_clock.enabled.load(Ordering::Relaxed));
        assert!(!f.handles.core_apb_rst.asserted.load(Ordering::Relaxed));
        assert!(!f.handles.core_rst.asserted.load(Ordering::Relaxed));
        for phy in &f.handles.phys {
            assert!(phy.powered.load(Ordering::Relaxed));
            assert_eq!(phy.calibrations.load(Ordering::Relaxed), 1);
        }

        let dm = appl::DmType::from_bits(f.handles.appl.peek(ApplReg::DM_TYPE.0));
        assert_eq!(dm.dm_type(), appl::DmTypeValue::ROOT_PORT);
        let misc = appl::CfgMisc::from_bits(f.handles.appl.peek(ApplReg::CFG_MISC.0));
        assert_eq!(misc.arcache(), appl::CFG_MISC_ARCACHE_VAL);
        assert!(!misc.slv_ep_mode());
        assert_eq!(
            f.handles.appl.peek(ApplReg::CFG_BASE_ADDR.0),
            0x3800_0000 & 0xFFFF_F000
        );
        // CLKREQ is overridden because the fixture has no CLKREQ routing.
        let pinmux = appl::Pinmux::from_bits(f.handles.appl.peek(ApplReg::PINMUX.0));
        assert!(pinmux.clkreq_override_en());
    }

    #[test]
    fn configure_port_unwinds_on_phy_failure() {
        let f = fixture();
        f.handles.phys[1].fail_power_on.store(true, Ordering::Relaxed);

        let err = f.power.configure_port(Mode::RootComplex, false).unwrap_err();
        assert!(format!("{err:#}").contains("PHY lane 1"));

        // Everything acquired before the failure was released, in
        // reverse.
        assert!(!f.handles.phys[0].powered.load(Ordering::Relaxed));
        assert!(!f.handles.core_clock.enabled.load(Ordering::Relaxed));
        assert!(f.handles.core_apb_rst.asserted.load(Ordering::Relaxed));
        assert!(!f.handles.port_power.enabled.load(Ordering::Relaxed));
    }

    #[test]
    fn hot_reset_done_blanket_clears_and_reenables_ltssm() {
        let f = fixture();
        // Latch junk into several status groups.
        for &group in appl::STATUS_GROUPS {
            f.handles.appl.poke_w1c(group.0, 0xDEAD_BEEF);
        }
        f.handles.appl.poke_w1c(ApplReg::MSI_CTRL_2.0, 0x1234);

        f.power.hot_reset_done();

        for &group in appl::STATUS_GROUPS {
            assert_eq!(f.handles.appl.peek(group.0), 0, "group {:#x}", group.0);
        }
        assert_eq!(f.handles.appl.peek(ApplReg::MSI_CTRL_2.0), 0);
        let ctrl = appl::Ctrl::from_bits(f.handles.appl.peek(ApplReg::CTRL.0));
        assert!(ctrl.ltssm_enable());
    }

    #[test]
    fn msi_vectors_save_restore_round_trip() {
        let f = fixture();
        f.handles.dbi.poke(DbiReg::MSI_CTRL_INT_0_EN.0, 0x00FF_00FF);
        f.power.save_msi_vectors();
        f.handles.dbi.poke(DbiReg::MSI_CTRL_INT_0_EN.0, 0);
        f.power.restore_msi_vectors();
        assert_eq!(f.handles.dbi.peek(DbiReg::MSI_CTRL_INT_0_EN.0), 0x00FF_00FF);
    }

    #[test]
    fn teardown_reporting_disables_error_sources() {
        let f = fixture();
        f.handles.appl.poke(
            ApplReg::INTR_EN_L1_8.0,
            appl::IntrEnL1_8::new().with_aer(true).with_intx(true).into_bits(),
        );
        f.handles.dbi.poke(
            DbiReg::COMMAND.0,
            dbi::Command::new().with_serr_enable(true).with_bus_master(true).into_bits(),
        );
        f.handles.dbi.poke_w1c(DbiReg::AER_ROOT_ERR_STATUS.0, 0x5);

        f.power.teardown_reporting();

        let l1_8 = appl::IntrEnL1_8::from_bits(f.handles.appl.peek(ApplReg::INTR_EN_L1_8.0));
        assert!(!l1_8.aer());
        assert!(l1_8.intx(), "only the AER enable may be cleared");
        let command = dbi::Command::from_bits(f.handles.dbi.peek(DbiReg::COMMAND.0));
        assert!(!command.serr_enable());
        assert!(command.bus_master());
        assert_eq!(f.handles.dbi.peek(DbiReg::AER_ROOT_ERR_STATUS.0), 0);
    }

    #[test]
    fn l2_exit_only_valid_from_l2() {
        let f = fixture();
        assert!(f.power.begin_exit_l2().is_err());

        make_link_up(&f);
        f.handles.appl.on_write(|bank, offset, value| {
            if offset == ApplReg::RADM_STATUS.0 && value & 1 != 0 {
                bank.poke(
                    ApplReg::DEBUG.0,
                    appl::Debug::new().with_pm_linkst_in_l2_lat(true).into_bits(),
                );
            }
        });
        f.power.enter_l2(&f.link);
        assert!(f.power.begin_exit_l2().is_ok());
        assert_eq!(f.power.state(), PowerState::ExitingL2);
        f.power.mark_active();
        assert_eq!(f.power.state(), PowerState::Active);
    }
}
