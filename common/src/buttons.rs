use crate::hardware::{ButtonAction, ButtonInputs, MAX_BUTTONS};

#[derive(Debug, Clone)]
pub struct ButtonInputMonitor {
    last_levels: [bool; MAX_BUTTONS],
    last_check_ms: u64,
    debounce_ms: u64,
}

impl ButtonInputMonitor {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            // Pull-ups: released reads HIGH.
            last_levels: [true; MAX_BUTTONS],
            last_check_ms: 0,
            debounce_ms,
        }
    }

    pub fn poll<I: ButtonInputs + ?Sized>(
        &mut self,
        now_ms: u64,
        inputs: &mut I,
        bindings: &[ButtonAction],
    ) -> Vec<ButtonAction> {
        if now_ms.wrapping_sub(self.last_check_ms) < self.debounce_ms {
            return Vec::new();
        }
        self.last_check_ms = now_ms;

        let mut pressed = Vec::new();
        for (index, action) in bindings.iter().enumerate().take(MAX_BUTTONS) {
            let level = inputs.is_high(index);
            if self.last_levels[index] && !level {
                pressed.push(*action);
            }
            self.last_levels[index] = level;
        }
        pressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hardware::{HardwareProfile, OutputChannel},
        testing::MockBoard,
    };
    use pretty_assertions::assert_eq;

    const BINDINGS: &[ButtonAction] = HardwareProfile::DUAL_OUTPUT.buttons;

    #[test]
    fn press_fires_once_and_release_is_silent() {
        let mut monitor = ButtonInputMonitor::new(50);
        let mut board = MockBoard::new();

        board.press(2);
        assert_eq!(
            monitor.poll(100, &mut board, BINDINGS),
            vec![ButtonAction::CycleVoltage]
        );
        assert!(monitor.poll(200, &mut board, BINDINGS).is_empty());

        board.release(2);
        assert!(monitor.poll(300, &mut board, BINDINGS).is_empty());
    }

    #[test]
    fn bounce_on_same_input_collapses_to_one_action() {
        let mut monitor = ButtonInputMonitor::new(50);
        let mut board = MockBoard::new();

        board.press(0);
        let first = monitor.poll(1_000, &mut board, BINDINGS);
        board.release(0);
        assert!(monitor.poll(1_020, &mut board, BINDINGS).is_empty());
        board.press(0);
        assert!(monitor.poll(1_030, &mut board, BINDINGS).is_empty());
        assert!(monitor.poll(1_060, &mut board, BINDINGS).is_empty());

        assert_eq!(first, vec![ButtonAction::Toggle(OutputChannel::Power)]);
    }

    #[test]
    fn window_is_shared_across_inputs() {
        let mut monitor = ButtonInputMonitor::new(50);
        let mut board = MockBoard::new();

        board.press(0);
        assert_eq!(monitor.poll(1_000, &mut board, BINDINGS).len(), 1);
        board.press(1);
        assert!(monitor.poll(1_010, &mut board, BINDINGS).is_empty());
        board.release(1);
        assert!(monitor.poll(1_050, &mut board, BINDINGS).is_empty());
    }

    #[test]
    fn simultaneous_presses_fire_in_input_order() {
        let mut monitor = ButtonInputMonitor::new(50);
        let mut board = MockBoard::new();

        board.press(3);
        board.press(1);

        assert_eq!(
            monitor.poll(500, &mut board, BINDINGS),
            vec![ButtonAction::Toggle(OutputChannel::Usb), ButtonAction::AllOn]
        );
    }

    #[test]
    fn unbound_inputs_are_not_sampled() {
        let mut monitor = ButtonInputMonitor::new(50);
        let mut board = MockBoard::new();
        board.press(2);

        let actions = monitor.poll(500, &mut board, HardwareProfile::SINGLE_OUTPUT.buttons);

        assert!(actions.is_empty());
    }
}
