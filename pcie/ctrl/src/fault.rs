// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fault classification and one-shot containment.
//!
//! The classifier decodes the hierarchical interrupt-status registers
//! into typed fault events and applies per-category containment: once a
//! category has fired, its interrupt-enable and fault-enable bits are
//! cleared for the remaining lifetime of the controller. The enable bits
//! in the register file *are* the containment state — a category whose
//! top-level enable reads clear is never classified again, so
//! re-delivering the same status bits cannot produce a second event.
//!
//! Two categories deviate from the generic treatment and must stay that
//! way:
//! - a parity interrupt whose only latched source is the retry-RAM bit
//!   does not escalate (that sub-condition is expected in operation);
//! - an interface-timeout interrupt write-1-clears the two downstream
//!   timer status registers before containment, because they are not
//!   auto-clearing and would re-latch the condition.

use crate::platform::ApplWindow;
use crate::platform::DbiWindow;
use pcie_ctrl_regs::appl::ApplReg;
use pcie_ctrl_regs::appl;
use pcie_ctrl_regs::dbi::DbiReg;
use pcie_ctrl_regs::dbi;
use tracing::error;
use tracing::info;

/// The fault categories the controller reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultCategory {
    /// TLP-level errors (ECRC, completion timeout, ...).
    TlpError,
    /// Uncorrectable memory ECC (RASDP).
    EccUncorrectable,
    /// RAM parity errors.
    ParityError,
    /// Configuration-register consistency-monitor mismatch.
    ConfigConsistencyMismatch,
    /// Interface transaction timeout.
    InterfaceTimeout,
    /// Other uncorrectable safety-logic errors.
    SafetyUncorrectable,
    /// Correctable safety-logic errors.
    SafetyCorrectable,
}

/// A classified fault, produced at most once per category.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    /// The contained category.
    pub category: FaultCategory,
    /// The category's detail status register at classification time.
    pub raw_status: u32,
}

/// A fault record as handed to the reporting sink.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    /// The contained category.
    pub category: FaultCategory,
    /// The category's detail status register at classification time.
    pub raw_status: u32,
    /// Monotonic hardware timestamp at reporting time.
    pub timestamp: u32,
}

/// Decodes interrupt status into fault events and contains each category
/// at first occurrence.
pub struct FaultClassifier {
    appl: ApplWindow,
    dbi: DbiWindow,
}

impl FaultClassifier {
    /// Creates the classifier over the two register windows.
    pub fn new(appl: ApplWindow, dbi: DbiWindow) -> Self {
        Self { appl, dbi }
    }

    /// Arms the fault interrupt sources serviced by [`Self::classify`].
    ///
    /// Called once during bring-up on safety builds; the classifier
    /// clears these enables again, category by category, as faults fire.
    pub fn enable_fault_interrupts(&self) {
        self.appl.update(ApplReg::FAULT_EN_L0, |v| {
            appl::FaultEnL0::from_bits(v)
                .with_tlp_err(true)
                .with_rasdp(true)
                .with_parity_err(true)
                .with_safety_uncorr(true)
                .into_bits()
        });
        self.appl.update(ApplReg::INTR_EN_L0, |v| {
            appl::IntrEnL0::from_bits(v)
                .with_tlp_err(true)
                .with_rasdp(true)
                .with_parity_err(true)
                .with_safety_uncorr(true)
                .into_bits()
        });

        // TLP error reporting.
        let tlp = appl::IntrL1_11::new()
            .with_fatal(true)
            .with_non_fatal(true)
            .into_bits();
        self.appl.update(ApplReg::FAULT_EN_L1_11, |v| v | tlp);
        self.appl.update(ApplReg::INTR_EN_L1_11, |v| v | tlp);

        // Uncorrectable memory ECC.
        let rasdp = appl::IntrL1_12::new()
            .with_mstr_rasdp(true)
            .with_slv_rasdp(true)
            .into_bits();
        self.appl.update(ApplReg::FAULT_EN_L1_12, |v| v | rasdp);
        self.appl.update(ApplReg::INTR_EN_L1_12, |v| v | rasdp);

        // Interface transaction timeout.
        let timeout = appl::IntrL1_20::new().with_if_timeout(true).into_bits();
        self.appl.update(ApplReg::FAULT_EN_L1_20, |v| v | timeout);
        self.appl.update(ApplReg::INTR_EN_L1_20, |v| v | timeout);

        self.dbi.update(DbiReg::PL_IF_TIMER_CONTROL, |v| {
            dbi::PlIfTimerControl::from_bits(v)
                .with_if_timer_en(true)
                .with_if_timer_aer_en(true)
                .into_bits()
        });

        // Mask every uncorrectable safety source except the interface
        // timeout; those categories are contained through the APPL fault
        // path instead.
        self.dbi.update(DbiReg::PL_SAFETY_MASK, |v| {
            dbi::PlSafetyMask::from_bits(v)
                .with_rasdp(true)
                .with_cdm(true)
                .with_uncor(true)
                .with_cor(true)
                .with_rasdp_cor(true)
                .into_bits()
        });
    }

    /// Arms the consistency-monitor interrupt sources.
    pub fn enable_cdm_check(&self) {
        self.appl.update(ApplReg::INTR_EN_L0, |v| {
            appl::IntrEnL0::from_bits(v).with_cdm_reg_chk(true).into_bits()
        });
        self.appl.update(ApplReg::FAULT_EN_L0, |v| {
            appl::FaultEnL0::from_bits(v).with_cdm_reg_chk(true).into_bits()
        });
        let cdm = appl::IntrL1_18::new()
            .with_cdm_cmp_err(true)
            .with_cdm_logic_err(true)
            .into_bits();
        self.appl.update(ApplReg::INTR_EN_L1_18, |v| v | cdm);
        self.appl.update(ApplReg::FAULT_EN_L1_18, |v| v | cdm);
    }

    /// Runs one classification pass over the top-level status.
    ///
    /// `escalate` is invoked once per category that was contained on this
    /// pass. Returns whether anything escalated (the caller schedules
    /// deferred reporting when it did).
    pub fn classify(
        &self,
        status_l0: appl::IntrStatusL0,
        mut escalate: impl FnMut(FaultEvent),
    ) -> bool {
        let en_l0 = appl::IntrEnL0::from_bits(self.appl.read(ApplReg::INTR_EN_L0));
        let mut escalated = false;
        let mut fire = |event: FaultEvent| {
            escalated = true;
            escalate(event);
        };

        // Consistency monitor for configuration registers.
        if status_l0.cdm_reg_chk() && en_l0.cdm_reg_chk() {
            let status = appl::IntrL1_18::from_bits(self.appl.read(ApplReg::INTR_STATUS_L1_18));
            let mut chk = dbi::PlChkRegControlStatus::from_bits(
                self.dbi.read(DbiReg::PL_CHK_REG_CONTROL_STATUS),
            );
            if status.cdm_chk_complete() {
                info!("CDM check complete");
                chk.set_complete(true);
            }
            if status.cdm_cmp_err() {
                error!("CDM comparison mismatch");
                chk.set_comparison_error(true);
            }
            if status.cdm_logic_err() {
                error!("CDM logic error");
                chk.set_logic_error(true);
            }
            self.dbi
                .write(DbiReg::PL_CHK_REG_CONTROL_STATUS, chk.into_bits());
            let err_addr = self.dbi.read(DbiReg::PL_CHK_REG_ERR_ADDR);
            error!(err_addr, "CDM error address offset");

            if status.cdm_cmp_err() || status.cdm_logic_err() {
                // Config space may not recover after CDM errors; disable
                // all CDM interrupts to avoid an interrupt storm.
                self.appl.write(ApplReg::INTR_EN_L1_18, 0);
                self.appl.write(ApplReg::FAULT_EN_L1_18, 0);
                self.appl.update(ApplReg::INTR_EN_L0, |v| {
                    appl::IntrEnL0::from_bits(v).with_cdm_reg_chk(false).into_bits()
                });
                self.appl.update(ApplReg::FAULT_EN_L0, |v| {
                    appl::FaultEnL0::from_bits(v).with_cdm_reg_chk(false).into_bits()
                });
                fire(FaultEvent {
                    category: FaultCategory::ConfigConsistencyMismatch,
                    raw_status: status.into_bits(),
                });
            }
        }

        // TLP errors (ECRC, completion timeout, ...).
        if status_l0.tlp_err() && en_l0.tlp_err() {
            let status = appl::IntrL1_11::from_bits(self.appl.read(ApplReg::INTR_STATUS_L1_11));
            self.appl.write(ApplReg::INTR_STATUS_L1_11, status.into_bits());

            if status.fatal() || status.non_fatal() {
                self.appl.write(ApplReg::INTR_EN_L1_11, 0);
                self.appl.write(ApplReg::FAULT_EN_L1_11, 0);
                self.appl.update(ApplReg::INTR_EN_L0, |v| {
                    appl::IntrEnL0::from_bits(v).with_tlp_err(false).into_bits()
                });
                self.appl.update(ApplReg::FAULT_EN_L0, |v| {
                    appl::FaultEnL0::from_bits(v).with_tlp_err(false).into_bits()
                });
                fire(FaultEvent {
                    category: FaultCategory::TlpError,
                    raw_status: status.into_bits(),
                });
            }
        }

        // Uncorrectable memory ECC.
        if status_l0.rasdp() && en_l0.rasdp() {
            let status = appl::IntrL1_12::from_bits(self.appl.read(ApplReg::INTR_STATUS_L1_12));
            if status.mstr_rasdp() || status.slv_rasdp() {
                // The register interface is not reliable after RASDP, so
                // disable the interrupts.
                self.appl.write(ApplReg::FAULT_EN_L1_12, 0);
                self.appl.write(ApplReg::INTR_EN_L1_12, 0);
                self.appl.update(ApplReg::INTR_EN_L0, |v| {
                    appl::IntrEnL0::from_bits(v).with_rasdp(false).into_bits()
                });
                self.appl.update(ApplReg::FAULT_EN_L0, |v| {
                    appl::FaultEnL0::from_bits(v).with_rasdp(false).into_bits()
                });
                fire(FaultEvent {
                    category: FaultCategory::EccUncorrectable,
                    raw_status: status.into_bits(),
                });
            }
        }

        // Parity errors.
        if status_l0.parity_err() && en_l0.parity_err() {
            let status =
                appl::IntrStatusL1_14::from_bits(self.appl.read(ApplReg::INTR_STATUS_L1_14));
            self.appl.write(ApplReg::INTR_STATUS_L1_14, status.into_bits());

            if status.any_source() {
                // Retry-RAM parity hits alone are expected; anything else
                // escalates.
                if status.any_besides_retry_ram() {
                    self.appl.update(ApplReg::INTR_EN_L0, |v| {
                        appl::IntrEnL0::from_bits(v).with_parity_err(false).into_bits()
                    });
                    self.appl.update(ApplReg::FAULT_EN_L0, |v| {
                        appl::FaultEnL0::from_bits(v).with_parity_err(false).into_bits()
                    });
                    fire(FaultEvent {
                        category: FaultCategory::ParityError,
                        raw_status: status.into_bits(),
                    });
                }
            }
        }

        // Interface transaction timeouts.
        if status_l0.safety_uncorr() && en_l0.safety_uncorr() {
            let status = appl::IntrL1_20::from_bits(self.appl.read(ApplReg::INTR_STATUS_L1_20));

            // The downstream timer status registers do not auto-clear;
            // write-1-clear them before containment or the condition
            // re-latches.
            let timer = self.dbi.read(DbiReg::PL_INTERFACE_TIMER_STATUS);
            self.dbi.write(DbiReg::PL_INTERFACE_TIMER_STATUS, timer);
            let safety = self.dbi.read(DbiReg::PL_SAFETY_STATUS);
            self.dbi.write(DbiReg::PL_SAFETY_STATUS, safety);

            if status.if_timeout() {
                let timeout = appl::IntrL1_20::new().with_if_timeout(true).into_bits();
                self.appl.update(ApplReg::FAULT_EN_L1_20, |v| v & !timeout);
                self.appl.update(ApplReg::INTR_EN_L1_20, |v| v & !timeout);
                self.appl.update(ApplReg::INTR_EN_L0, |v| {
                    appl::IntrEnL0::from_bits(v).with_safety_uncorr(false).into_bits()
                });
                self.appl.update(ApplReg::FAULT_EN_L0, |v| {
                    appl::FaultEnL0::from_bits(v).with_safety_uncorr(false).into_bits()
                });
                fire(FaultEvent {
                    category: FaultCategory::InterfaceTimeout,
                    raw_status: status.into_bits(),
                });
            }
        }

        // Correctable safety-logic errors.
        if status_l0.safety_corr() && en_l0.safety_corr() {
            let status = appl::IntrL1_19::from_bits(self.appl.read(ApplReg::INTR_STATUS_L1_19));
            self.appl.write(ApplReg::INTR_STATUS_L1_19, status.into_bits());

            if status.safety_corr() {
                self.appl.write(ApplReg::INTR_EN_L1_19, 0);
                self.appl.write(ApplReg::FAULT_EN_L1_19, 0);
                self.appl.update(ApplReg::INTR_EN_L0, |v| {
                    appl::IntrEnL0::from_bits(v).with_safety_corr(false).into_bits()
                });
                fire(FaultEvent {
                    category: FaultCategory::SafetyCorrectable,
                    raw_status: status.into_bits(),
                });
            }
        }

        escalated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::TestRegisterBank;
    use pcie_ctrl_regs::appl::ApplReg;
    use std::sync::Arc;

    fn classifier() -> (Arc<TestRegisterBank>, Arc<TestRegisterBank>, FaultClassifier) {
        let appl_bank = Arc::new(TestRegisterBank::new());
        let dbi_bank = Arc::new(TestRegisterBank::new());
        let classifier = FaultClassifier::new(
            ApplWindow::new(appl_bank.clone()),
            DbiWindow::new(dbi_bank.clone()),
        );
        classifier.enable_fault_interrupts();
        classifier.enable_cdm_check();
        (appl_bank, dbi_bank, classifier)
    }

    fn classify_collecting(
        classifier: &FaultClassifier,
        appl_bank: &TestRegisterBank,
    ) -> Vec<FaultEvent> {
        let status =
            appl::IntrStatusL0::from_bits(appl_bank.peek(ApplReg::INTR_STATUS_L0.0));
        let mut events = Vec::new();
        classifier.classify(status, |event| events.push(event));
        events
    }

    #[test]
    fn cdm_mismatch_contains_once() {
        let (appl_bank, dbi_bank, classifier) = classifier();
        appl_bank.poke(
            ApplReg::INTR_STATUS_L0.0,
            appl::IntrStatusL0::new().with_cdm_reg_chk(true).into_bits(),
        );
        appl_bank.poke(
            ApplReg::INTR_STATUS_L1_18.0,
            appl::IntrL1_18::new().with_cdm_cmp_err(true).into_bits(),
        );

        let events = classify_collecting(&classifier, &appl_bank);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, FaultCategory::ConfigConsistencyMismatch);

        // Containment: every CDM enable now reads disabled.
        assert_eq!(appl_bank.peek(ApplReg::INTR_EN_L1_18.0), 0);
        assert_eq!(appl_bank.peek(ApplReg::FAULT_EN_L1_18.0), 0);
        let en_l0 = appl::IntrEnL0::from_bits(appl_bank.peek(ApplReg::INTR_EN_L0.0));
        assert!(!en_l0.cdm_reg_chk());

        // The comparison-error bit was reflected into the port-logic
        // check register.
        let chk = dbi::PlChkRegControlStatus::from_bits(
            dbi_bank.peek(DbiReg::PL_CHK_REG_CONTROL_STATUS.0),
        );
        assert!(chk.comparison_error());

        // Re-delivering the identical interrupt produces nothing.
        let events = classify_collecting(&classifier, &appl_bank);
        assert!(events.is_empty());
    }

    #[test]
    fn parity_retry_ram_only_is_benign() {
        let (appl_bank, _dbi_bank, classifier) = classifier();
        appl_bank.poke(
            ApplReg::INTR_STATUS_L0.0,
            appl::IntrStatusL0::new().with_parity_err(true).into_bits(),
        );
        appl_bank.poke_w1c(ApplReg::INTR_STATUS_L1_14.0, 1 << 23);

        let events = classify_collecting(&classifier, &appl_bank);
        assert!(events.is_empty());

        // Parity stays armed.
        let en_l0 = appl::IntrEnL0::from_bits(appl_bank.peek(ApplReg::INTR_EN_L0.0));
        assert!(en_l0.parity_err());
        // The latched sources were still cleared.
        assert_eq!(appl_bank.peek(ApplReg::INTR_STATUS_L1_14.0), 0);
    }

    #[test]
    fn parity_retry_ram_plus_other_escalates() {
        let (appl_bank, _dbi_bank, classifier) = classifier();
        appl_bank.poke(
            ApplReg::INTR_STATUS_L0.0,
            appl::IntrStatusL0::new().with_parity_err(true).into_bits(),
        );
        appl_bank.poke(ApplReg::INTR_STATUS_L1_14.0, 1 << 23 | 1 << 5);

        let events = classify_collecting(&classifier, &appl_bank);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, FaultCategory::ParityError);
        let en_l0 = appl::IntrEnL0::from_bits(appl_bank.peek(ApplReg::INTR_EN_L0.0));
        assert!(!en_l0.parity_err());
    }

    #[test]
    fn interface_timeout_clears_downstream_status_before_containment() {
        let (appl_bank, dbi_bank, classifier) = classifier();
        appl_bank.poke(
            ApplReg::INTR_STATUS_L0.0,
            appl::IntrStatusL0::new().with_safety_uncorr(true).into_bits(),
        );
        appl_bank.poke(
            ApplReg::INTR_STATUS_L1_20.0,
            appl::IntrL1_20::new().with_if_timeout(true).into_bits(),
        );
        dbi_bank.poke_w1c(DbiReg::PL_INTERFACE_TIMER_STATUS.0, 0x3);
        dbi_bank.poke_w1c(DbiReg::PL_SAFETY_STATUS.0, 0x4);

        let events = classify_collecting(&classifier, &appl_bank);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, FaultCategory::InterfaceTimeout);

        // Both W1C status registers were cleared.
        assert_eq!(dbi_bank.peek(DbiReg::PL_INTERFACE_TIMER_STATUS.0), 0);
        assert_eq!(dbi_bank.peek(DbiReg::PL_SAFETY_STATUS.0), 0);

        let en_l0 = appl::IntrEnL0::from_bits(appl_bank.peek(ApplReg::INTR_EN_L0.0));
        assert!(!en_l0.safety_uncorr());
        let en_l1 = appl::IntrL1_20::from_bits(appl_bank.peek(ApplReg::INTR_EN_L1_20.0));
        assert!(!en_l1.if_timeout());
    }

    #[test]
    fn rasdp_and_tlp_contain_independently() {
        let (appl_bank, _dbi_bank, classifier) = classifier();
        appl_bank.poke(
            ApplReg::INTR_STATUS_L0.0,
            appl::IntrStatusL0::new()
                .with_rasdp(true)
                .with_tlp_err(true)
                .into_bits(),
        );
        appl_bank.poke(
            ApplReg::INTR_STATUS_L1_12.0,
            appl::IntrL1_12::new().with_mstr_rasdp(true).into_bits(),
        );
        appl_bank.poke(
            ApplReg::INTR_STATUS_L1_11.0,
            appl::IntrL1_11::new().with_non_fatal(true).into_bits(),
        );

        let events = classify_collecting(&classifier, &appl_bank);
        let categories: Vec<_> = events.iter().map(|e| e.category).collect();
        assert!(categories.contains(&FaultCategory::EccUncorrectable));
        assert!(categories.contains(&FaultCategory::TlpError));

        // Parity was untouched by either containment.
        let en_l0 = appl::IntrEnL0::from_bits(appl_bank.peek(ApplReg::INTR_EN_L0.0));
        assert!(en_l0.parity_err());
        assert!(!en_l0.rasdp());
        assert!(!en_l0.tlp_err());
    }
}
