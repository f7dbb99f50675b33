//! Single/double/long click recognition.
//!
//! [`GestureRecognizer`] is a plain state machine: callers feed it presses,
//! releases and the current time, and ask it for the next deadline. Pending
//! timers are deadlines stored on each button, so cancelling one is just
//! clearing it, and everything runs on whichever single loop owns the
//! recognizer.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

pub const LONG_PRESS_THRESHOLD: Duration = Duration::from_millis(500);
pub const DOUBLE_CLICK_WINDOW: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum GestureKind {
    Single,
    Double,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gesture {
    pub button: u8,
    pub kind: GestureKind,
}

#[derive(Debug, Default)]
struct ButtonState {
    pressed: bool,
    press_at: Option<Instant>,
    last_release: Option<Instant>,
    click_count: u8,
    long_fired: bool,
    long_deadline: Option<Instant>,
    single_deadline: Option<Instant>,
}

impl ButtonState {
    fn reset(&mut self) {
        self.click_count = 0;
        self.long_fired = false;
        self.long_deadline = None;
        self.single_deadline = None;
    }
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    LongPress,
    SingleClick,
}

#[derive(Debug, Default)]
pub struct GestureRecognizer {
    buttons: BTreeMap<u8, ButtonState>,
}

impl GestureRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_press(&mut self, button: u8, now: Instant) {
        let state = self.buttons.entry(button).or_default();
        state.single_deadline = None;

        let within_window = state
            .last_release
            .is_some_and(|released| now.duration_since(released) < DOUBLE_CLICK_WINDOW);

        if within_window && state.click_count == 1 {
            state.click_count = 2;
        } else {
            state.click_count = 1;
        }

        state.pressed = true;
        state.press_at = Some(now);
        state.long_fired = false;
        state.long_deadline = Some(now + LONG_PRESS_THRESHOLD);
    }

    pub fn on_release(&mut self, button: u8, now: Instant) -> Option<Gesture> {
        let state = self.buttons.entry(button).or_default();
        state.long_deadline = None;
        state.pressed = false;
        state.last_release = Some(now);

        if let Some(pressed_at) = state.press_at.take() {
            trace!(
                "Button {} released after {:?}",
                button,
                now.duration_since(pressed_at)
            );
        }

        if state.long_fired {
            state.reset();
            return None;
        }

        match state.click_count {
            2 => {
                state.reset();
                Some(Gesture {
                    button,
                    kind: GestureKind::Double,
                })
            }
            1 => {
                state.single_deadline = Some(now + DOUBLE_CLICK_WINDOW);
                None
            }
            _ => None,
        }
    }

    /// Earliest pending timer across all buttons
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buttons
            .values()
            .flat_map(|s| [s.long_deadline, s.single_deadline])
            .flatten()
            .min()
    }

    /// Fire every timer due at `now`, in deadline order
    pub fn fire_due(&mut self, now: Instant) -> Vec<Gesture> {
        let mut due = Vec::new();
        for (&button, state) in &self.buttons {
            if let Some(at) = state.long_deadline.filter(|at| *at <= now) {
                due.push((at, button, Timer::LongPress));
            }
            if let Some(at) = state.single_deadline.filter(|at| *at <= now) {
                due.push((at, button, Timer::SingleClick));
            }
        }
        due.sort_by_key(|(at, button, _)| (*at, *button));

        let mut fired = Vec::new();
        for (_, button, timer) in due {
            let Some(state) = self.buttons.get_mut(&button) else {
                continue;
            };

            match timer {
                Timer::LongPress => {
                    state.long_deadline = None;
                    if state.pressed && !state.long_fired {
                        state.long_fired = true;
                        state.click_count = 0;
                        state.single_deadline = None;
                        fired.push(Gesture {
                            button,
                            kind: GestureKind::Long,
                        });
                    }
                }
                Timer::SingleClick => {
                    state.single_deadline = None;
                    if state.click_count == 1 {
                        state.reset();
                        fired.push(Gesture {
                            button,
                            kind: GestureKind::Single,
                        });
                    }
                }
            }
        }

        for gesture in &fired {
            debug!("Button {} {}", gesture.button, gesture.kind);
        }
        fired
    }

    /// Drop every pending timer and all button state
    pub fn destroy(&mut self) {
        self.buttons.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn gesture(button: u8, kind: GestureKind) -> Gesture {
        Gesture { button, kind }
    }

    #[test]
    fn test_single_click_fires_after_window() {
        let t0 = Instant::now();
        let mut r = GestureRecognizer::new();

        r.on_press(1, t0);
        assert_eq!(r.on_release(1, t0 + ms(100)), None);
        assert_eq!(r.next_deadline(), Some(t0 + ms(400)));

        assert!(r.fire_due(t0 + ms(399)).is_empty());
        assert_eq!(r.fire_due(t0 + ms(400)), vec![gesture(1, GestureKind::Single)]);
        assert_eq!(r.next_deadline(), None);
    }

    #[test]
    fn test_double_click_fires_on_second_release() {
        let t0 = Instant::now();
        let mut r = GestureRecognizer::new();

        r.on_press(2, t0);
        r.on_release(2, t0 + ms(80));
        r.on_press(2, t0 + ms(200));
        assert!(r.fire_due(t0 + ms(250)).is_empty());
        assert_eq!(
            r.on_release(2, t0 + ms(260)),
            Some(gesture(2, GestureKind::Double))
        );

        // Nothing else is pending for this interaction
        assert_eq!(r.next_deadline(), None);
    }

    #[test]
    fn test_second_press_after_window_starts_new_sequence() {
        let t0 = Instant::now();
        let mut r = GestureRecognizer::new();

        r.on_press(1, t0);
        r.on_release(1, t0 + ms(50));
        assert_eq!(r.fire_due(t0 + ms(350)), vec![gesture(1, GestureKind::Single)]);

        r.on_press(1, t0 + ms(360));
        assert_eq!(r.on_release(1, t0 + ms(400)), None);
        assert_eq!(r.fire_due(t0 + ms(700)), vec![gesture(1, GestureKind::Single)]);
    }

    #[test]
    fn test_long_press_fires_while_held() {
        let t0 = Instant::now();
        let mut r = GestureRecognizer::new();

        r.on_press(2, t0);
        assert!(r.fire_due(t0 + ms(499)).is_empty());
        assert_eq!(r.fire_due(t0 + ms(500)), vec![gesture(2, GestureKind::Long)]);

        assert_eq!(r.on_release(2, t0 + ms(600)), None);
        assert!(r.fire_due(t0 + ms(2000)).is_empty());
    }

    #[test]
    fn test_long_press_on_second_click_suppresses_double() {
        let t0 = Instant::now();
        let mut r = GestureRecognizer::new();

        r.on_press(1, t0);
        r.on_release(1, t0 + ms(50));
        r.on_press(1, t0 + ms(100));
        assert_eq!(r.fire_due(t0 + ms(600)), vec![gesture(1, GestureKind::Long)]);
        assert_eq!(r.on_release(1, t0 + ms(700)), None);
        assert!(r.fire_due(t0 + ms(2000)).is_empty());
    }

    #[test]
    fn test_buttons_are_independent() {
        let t0 = Instant::now();
        let mut r = GestureRecognizer::new();

        r.on_press(1, t0);
        r.on_press(3, t0 + ms(10));
        r.on_release(1, t0 + ms(20));
        r.on_release(3, t0 + ms(30));

        assert_eq!(
            r.fire_due(t0 + ms(400)),
            vec![gesture(1, GestureKind::Single), gesture(3, GestureKind::Single)]
        );
    }

    #[test]
    fn test_destroy_cancels_pending_timers() {
        let t0 = Instant::now();
        let mut r = GestureRecognizer::new();

        r.on_press(1, t0);
        r.on_release(1, t0 + ms(10));
        r.on_press(2, t0);
        r.destroy();

        assert_eq!(r.next_deadline(), None);
        assert!(r.fire_due(t0 + ms(5000)).is_empty());
    }

    #[test]
    fn test_gesture_kind_strings() {
        assert_eq!(GestureKind::Single.to_string(), "single");
        assert_eq!(GestureKind::Double.to_string(), "double");
        assert_eq!("long".parse::<GestureKind>().unwrap(), GestureKind::Long);
    }
}
