//! Brightness control over DDC/CI, fanned out across every connected monitor.

use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use ddc_hi::{Ddc, Display};
use log::{info, warn};

/// VCP feature code for the luminance register.
pub const BRIGHTNESS_VCP: u8 = 0x10;
/// Highest level a display accepts, in percent.
pub const MAX_LEVEL: u16 = 100;
/// Default adjustment per keypress, in percentage points.
pub const DEFAULT_STEP: u16 = 10;

/// One open control channel to a physical monitor.
pub trait VcpDevice {
    fn name(&self) -> &str;
    /// Reads a feature register as its (high, low) byte pair.
    fn get_feature(&mut self, code: u8) -> Result<(u8, u8)>;
    fn set_feature(&mut self, code: u8, value: u16) -> Result<()>;
}

pub struct DdcDisplay {
    name: String,
    display: Display,
}

impl DdcDisplay {
    fn new(display: Display) -> Self {
        let name = display
            .info
            .model_name
            .clone()
            .unwrap_or_else(|| display.info.id.clone());
        Self { name, display }
    }
}

impl VcpDevice for DdcDisplay {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_feature(&mut self, code: u8) -> Result<(u8, u8)> {
        let value = self.display.handle.get_vcp_feature(code)?;
        Ok((value.sh, value.sl))
    }

    fn set_feature(&mut self, code: u8, value: u16) -> Result<()> {
        self.display.handle.set_vcp_feature(code, value)?;
        Ok(())
    }
}

/// Owns the set of opened displays and keeps their levels moving in lockstep.
///
/// The first display's level stands in for the whole group: a relative step
/// reads display 0 and writes the computed target everywhere. Displays that
/// have drifted apart end up uniform rather than per-display correct.
pub struct BrightnessCoordinator<D> {
    displays: Vec<Mutex<D>>,
    step: u16,
}

impl BrightnessCoordinator<DdcDisplay> {
    /// Opens every DDC/CI-capable display, skipping any that fail to answer
    /// a brightness read. Errors only when none remain.
    pub fn open(step: u16) -> Result<Self> {
        let mut displays = Vec::new();
        for mut candidate in Display::enumerate().into_iter().map(DdcDisplay::new) {
            match candidate.get_feature(BRIGHTNESS_VCP) {
                Ok(_) => {
                    info!("opened display {}", candidate.name());
                    displays.push(candidate);
                }
                Err(e) => warn!("skipping display {}: {e:#}", candidate.name()),
            }
        }
        Self::with_displays(displays, step)
    }
}

impl<D: VcpDevice> BrightnessCoordinator<D> {
    pub fn with_displays(displays: Vec<D>, step: u16) -> Result<Self> {
        if displays.is_empty() {
            bail!("no DDC/CI-capable displays found");
        }
        Ok(Self {
            displays: displays.into_iter().map(Mutex::new).collect(),
            step,
        })
    }

    pub fn display_count(&self) -> usize {
        self.displays.len()
    }

    pub fn display_names(&self) -> Vec<String> {
        self.displays
            .iter()
            .map(|d| d.lock().unwrap().name().to_string())
            .collect()
    }

    /// Current level of the first display, standing in for the whole set.
    pub fn current_level(&self) -> Result<u16> {
        let mut display = self.displays[0].lock().unwrap();
        let (high, low) = display
            .get_feature(BRIGHTNESS_VCP)
            .with_context(|| format!("cannot read brightness from {}", display.name()))?;
        Ok(u16::from(high) << 8 | u16::from(low))
    }

    /// Writes `value`, clamped to [0, 100], to every display in turn.
    ///
    /// Each write is an independent round trip; a failure is logged and
    /// counted but does not stop the fan-out, and writes that already
    /// landed are not rolled back. Any failure makes the whole call fail.
    pub fn set_level(&self, value: u16) -> Result<u16> {
        let value = value.min(MAX_LEVEL);
        let mut failures = 0usize;
        for display in &self.displays {
            let mut display = display.lock().unwrap();
            if let Err(e) = display.set_feature(BRIGHTNESS_VCP, value) {
                warn!("failed to set brightness on {}: {e:#}", display.name());
                failures += 1;
            }
        }
        if failures > 0 {
            bail!(
                "{failures} of {} displays rejected the write",
                self.displays.len()
            );
        }
        Ok(value)
    }

    pub fn step_up(&self) -> Result<()> {
        self.adjust(self.step as i16)
    }

    pub fn step_down(&self) -> Result<()> {
        self.adjust(-(self.step as i16))
    }

    fn adjust(&self, delta: i16) -> Result<()> {
        let current = match self.current_level() {
            Ok(level) => level,
            Err(e) => {
                warn!("{e:#}; leaving brightness unchanged");
                return Ok(());
            }
        };
        let target = if delta < 0 {
            current.saturating_sub(delta.unsigned_abs())
        } else {
            current.saturating_add(delta as u16)
        };
        let applied = self.set_level(target)?;
        info!("brightness {current}% -> {applied}%");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use anyhow::bail;

    use super::*;

    #[derive(Default)]
    struct FakeState {
        level: u16,
        writes: Vec<u16>,
        reads: usize,
        fail_reads: bool,
        fail_writes: bool,
    }

    struct FakeDisplay {
        state: Rc<RefCell<FakeState>>,
    }

    fn fake(level: u16) -> (FakeDisplay, Rc<RefCell<FakeState>>) {
        let state = Rc::new(RefCell::new(FakeState {
            level,
            ..FakeState::default()
        }));
        (
            FakeDisplay {
                state: Rc::clone(&state),
            },
            state,
        )
    }

    impl VcpDevice for FakeDisplay {
        fn name(&self) -> &str {
            "fake"
        }

        fn get_feature(&mut self, code: u8) -> Result<(u8, u8)> {
            assert_eq!(code, BRIGHTNESS_VCP);
            let mut state = self.state.borrow_mut();
            if state.fail_reads {
                bail!("i2c read failed");
            }
            state.reads += 1;
            Ok(((state.level >> 8) as u8, (state.level & 0xff) as u8))
        }

        fn set_feature(&mut self, code: u8, value: u16) -> Result<()> {
            assert_eq!(code, BRIGHTNESS_VCP);
            let mut state = self.state.borrow_mut();
            if state.fail_writes {
                bail!("i2c write failed");
            }
            state.level = value;
            state.writes.push(value);
            Ok(())
        }
    }

    #[test]
    fn refuses_empty_display_set() {
        assert!(BrightnessCoordinator::<FakeDisplay>::with_displays(vec![], DEFAULT_STEP).is_err());
    }

    #[test]
    fn step_up_clamps_at_max() {
        let (display, state) = fake(95);
        let ctrl = BrightnessCoordinator::with_displays(vec![display], 10).unwrap();
        ctrl.step_up().unwrap();
        assert_eq!(state.borrow().writes, vec![100]);
    }

    #[test]
    fn step_down_saturates_at_zero() {
        let (display, state) = fake(5);
        let ctrl = BrightnessCoordinator::with_displays(vec![display], 10).unwrap();
        ctrl.step_down().unwrap();
        assert_eq!(state.borrow().writes, vec![0]);
    }

    #[test]
    fn set_level_clamps_absolute_values() {
        let (display, state) = fake(50);
        let ctrl = BrightnessCoordinator::with_displays(vec![display], 10).unwrap();
        assert_eq!(ctrl.set_level(250).unwrap(), 100);
        assert_eq!(state.borrow().writes, vec![100]);
    }

    #[test]
    fn step_writes_to_every_display() {
        let (first, first_state) = fake(50);
        let (second, second_state) = fake(50);
        let ctrl = BrightnessCoordinator::with_displays(vec![first, second], 10).unwrap();
        ctrl.step_up().unwrap();
        assert_eq!(first_state.borrow().writes, vec![60]);
        assert_eq!(second_state.borrow().writes, vec![60]);
    }

    #[test]
    fn only_first_display_is_read() {
        let (first, first_state) = fake(50);
        let (second, second_state) = fake(30);
        let ctrl = BrightnessCoordinator::with_displays(vec![first, second], 10).unwrap();
        assert_eq!(ctrl.current_level().unwrap(), 50);
        assert_eq!(ctrl.current_level().unwrap(), 50);
        ctrl.step_up().unwrap();
        assert_eq!(first_state.borrow().reads, 3);
        assert_eq!(second_state.borrow().reads, 0);
        // The drifted sibling is pulled to the group target, not stepped.
        assert_eq!(second_state.borrow().level, 60);
    }

    #[test]
    fn partial_write_failure_reports_failure_without_rollback() {
        let (good, good_state) = fake(50);
        let (bad, bad_state) = fake(50);
        bad_state.borrow_mut().fail_writes = true;
        let ctrl = BrightnessCoordinator::with_displays(vec![good, bad], 10).unwrap();
        assert!(ctrl.step_up().is_err());
        assert_eq!(good_state.borrow().level, 60);
        assert_eq!(bad_state.borrow().level, 50);
    }

    #[test]
    fn unknown_level_skips_adjustment() {
        let (display, state) = fake(50);
        state.borrow_mut().fail_reads = true;
        let ctrl = BrightnessCoordinator::with_displays(vec![display], 10).unwrap();
        ctrl.step_up().unwrap();
        assert!(state.borrow().writes.is_empty());
    }

    #[test]
    fn level_is_recombined_from_byte_pair() {
        let (display, _) = fake(0x0132);
        let ctrl = BrightnessCoordinator::with_displays(vec![display], 10).unwrap();
        assert_eq!(ctrl.current_level().unwrap(), 306);
    }
}
