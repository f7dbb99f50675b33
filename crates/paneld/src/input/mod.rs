mod gesture;
mod reader;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

pub use gesture::DOUBLE_CLICK_WINDOW;
pub use gesture::Gesture;
pub use gesture::GestureKind;
pub use gesture::GestureRecognizer;
pub use gesture::LONG_PRESS_THRESHOLD;
pub use reader::InputReader;
pub use reader::KeyEvent;

/// Key codes of the physical buttons, in button order (F1..F4)
const BUTTON_KEY_CODES: std::ops::RangeInclusive<u16> = 59..=62;

/// Map a key code to its 1-based button number
pub fn button_for_key(code: u16) -> Option<u8> {
    BUTTON_KEY_CODES
        .contains(&code)
        .then(|| (code - BUTTON_KEY_CODES.start() + 1) as u8)
}

/// What the input pipeline tells the rest of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// Any key went down
    Interaction,
    Gesture(Gesture),
    /// A key that is not one of the buttons
    UnknownKey(KeyEvent),
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Serialized control loop owning all gesture state.
///
/// Key events and gesture timers are handled on this one task; due timers
/// always fire before the next key event is applied. Returns when `keys`
/// closes or `out` has no receiver.
pub async fn run_gestures(
    mut keys: mpsc::UnboundedReceiver<KeyEvent>,
    out: mpsc::UnboundedSender<InputEvent>,
) {
    let mut recognizer = GestureRecognizer::new();

    loop {
        let deadline = recognizer.next_deadline();

        let key = tokio::select! {
            biased;
            _ = wait_until(deadline) => None,
            key = keys.recv() => match key {
                Some(key) => Some(key),
                None => break,
            },
        };

        let now = Instant::now();
        let mut emitted: Vec<InputEvent> = recognizer
            .fire_due(now)
            .into_iter()
            .map(InputEvent::Gesture)
            .collect();

        if let Some(key) = key {
            if key.pressed {
                emitted.push(InputEvent::Interaction);
            }

            match button_for_key(key.code) {
                Some(button) if key.pressed => recognizer.on_press(button, now),
                Some(button) => {
                    if let Some(gesture) = recognizer.on_release(button, now) {
                        emitted.push(InputEvent::Gesture(gesture));
                    }
                }
                None => emitted.push(InputEvent::UnknownKey(key)),
            }
        }

        for event in emitted {
            if out.send(event).is_err() {
                debug!("Input consumer gone, stopping gesture loop");
                recognizer.destroy();
                return;
            }
        }
    }

    recognizer.destroy();
    debug!("Gesture loop finished");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn key(code: u16, pressed: bool) -> KeyEvent {
        KeyEvent { code, pressed }
    }

    #[test]
    fn test_button_mapping() {
        assert_eq!(button_for_key(59), Some(1));
        assert_eq!(button_for_key(62), Some(4));
        assert_eq!(button_for_key(58), None);
        assert_eq!(button_for_key(63), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_emits_single_long_gesture() {
        let (key_tx, key_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_gestures(key_rx, out_tx));

        // Button 2 held for 600 ms
        key_tx.send(key(60, true)).unwrap();
        assert_eq!(out_rx.recv().await, Some(InputEvent::Interaction));

        let started = Instant::now();
        assert_eq!(
            out_rx.recv().await,
            Some(InputEvent::Gesture(Gesture {
                button: 2,
                kind: GestureKind::Long
            }))
        );
        assert!(started.elapsed() >= Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(100)).await;
        key_tx.send(key(60, false)).unwrap();

        drop(key_tx);
        task.await.unwrap();
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_click_arrives_after_window() {
        let (key_tx, key_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_gestures(key_rx, out_tx));

        key_tx.send(key(59, true)).unwrap();
        assert_eq!(out_rx.recv().await, Some(InputEvent::Interaction));
        tokio::time::sleep(Duration::from_millis(50)).await;
        key_tx.send(key(59, false)).unwrap();
        let released = Instant::now();

        assert_eq!(
            out_rx.recv().await,
            Some(InputEvent::Gesture(Gesture {
                button: 1,
                kind: GestureKind::Single
            }))
        );
        assert!(released.elapsed() >= DOUBLE_CLICK_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_click_and_unknown_keys() {
        let (key_tx, key_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_gestures(key_rx, out_tx));

        key_tx.send(key(61, true)).unwrap();
        key_tx.send(key(61, false)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        key_tx.send(key(61, true)).unwrap();
        key_tx.send(key(61, false)).unwrap();
        key_tx.send(key(116, true)).unwrap();

        let mut events = Vec::new();
        for _ in 0..5 {
            events.push(out_rx.recv().await.unwrap());
        }

        assert_eq!(
            events,
            vec![
                InputEvent::Interaction,
                InputEvent::Interaction,
                InputEvent::Gesture(Gesture {
                    button: 3,
                    kind: GestureKind::Double
                }),
                InputEvent::Interaction,
                InputEvent::UnknownKey(key(116, true)),
            ]
        );
    }
}
