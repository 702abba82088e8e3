//! Cell key bindings, including the `Ctrl-C` chord prefix.

use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;

/// How long `Ctrl-C` stays armed waiting for the second key.
pub const CHORD_WINDOW: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    ShiftEnter,
    ShiftTab,
    CtrlC,
    CtrlL,
    CtrlComma,
}

impl FromStr for Key {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shift-enter" => Ok(Key::ShiftEnter),
            "shift-tab" => Ok(Key::ShiftTab),
            "ctrl-c" => Ok(Key::CtrlC),
            "ctrl-l" => Ok(Key::CtrlL),
            "ctrl-," => Ok(Key::CtrlComma),
            _ => Err(format!("unbound key {s:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellAction {
    Run,
    Complete,
    Inspect,
}

/// Result of one key press.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyOutcome {
    pub action: Option<CellAction>,
    /// New text for the cell info line, if it changes.
    pub info: Option<String>,
}

impl KeyOutcome {
    fn action(action: CellAction) -> Self {
        Self {
            action: Some(action),
            info: None,
        }
    }

    fn chord(action: Option<CellAction>, info: &str) -> Self {
        Self {
            action,
            info: Some(info.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChordState {
    armed_at: Option<Instant>,
    window: Duration,
}

impl Default for ChordState {
    fn default() -> Self {
        Self::new(CHORD_WINDOW)
    }
}

impl ChordState {
    pub fn new(window: Duration) -> Self {
        Self {
            armed_at: None,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_armed(&self, now: Instant) -> bool {
        self.armed_at
            .is_some_and(|armed| now.saturating_duration_since(armed) < self.window)
    }

    /// When the armed prefix lapses.
    pub fn deadline(&self) -> Option<Instant> {
        self.armed_at.map(|armed| armed + self.window)
    }

    /// Drop an expired prefix. Returns true if one was dropped.
    pub fn expire(&mut self, now: Instant) -> bool {
        if self.armed_at.is_some() && !self.is_armed(now) {
            self.armed_at = None;
            return true;
        }
        false
    }

    pub fn press(&mut self, key: Key, now: Instant) -> KeyOutcome {
        let armed = self.is_armed(now);
        match key {
            Key::ShiftEnter => {
                self.armed_at = None;
                KeyOutcome::action(CellAction::Run)
            }
            Key::ShiftTab => {
                self.armed_at = None;
                KeyOutcome::action(CellAction::Inspect)
            }
            Key::CtrlC if armed => {
                self.armed_at = None;
                KeyOutcome::chord(Some(CellAction::Complete), "Ctrl-c+Ctrl-c")
            }
            Key::CtrlC => {
                self.armed_at = Some(now);
                KeyOutcome::chord(None, "Ctrl-c+")
            }
            Key::CtrlL => {
                self.armed_at = None;
                if armed {
                    KeyOutcome::chord(Some(CellAction::Run), "Ctrl-c+Ctrl-l")
                } else {
                    KeyOutcome::default()
                }
            }
            Key::CtrlComma => {
                self.armed_at = None;
                if armed {
                    KeyOutcome::chord(Some(CellAction::Inspect), "Ctrl-c+Ctrl-,")
                } else {
                    KeyOutcome::default()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys() {
        assert_eq!("Shift-Enter".parse::<Key>().unwrap(), Key::ShiftEnter);
        assert_eq!("Ctrl-c".parse::<Key>().unwrap(), Key::CtrlC);
        assert_eq!("Ctrl-,".parse::<Key>().unwrap(), Key::CtrlComma);
        assert!("Ctrl-Z".parse::<Key>().is_err());
    }

    #[test]
    fn test_direct_bindings() {
        let mut chords = ChordState::default();
        let now = Instant::now();
        assert_eq!(chords.press(Key::ShiftEnter, now).action, Some(CellAction::Run));
        assert_eq!(chords.press(Key::ShiftTab, now).action, Some(CellAction::Inspect));
    }

    #[test]
    fn test_ctrl_c_ctrl_c_completes() {
        let mut chords = ChordState::default();
        let now = Instant::now();
        let first = chords.press(Key::CtrlC, now);
        assert_eq!(first, KeyOutcome::chord(None, "Ctrl-c+"));
        assert!(chords.is_armed(now));

        let second = chords.press(Key::CtrlC, now + Duration::from_millis(200));
        assert_eq!(second.action, Some(CellAction::Complete));
        assert_eq!(second.info.as_deref(), Some("Ctrl-c+Ctrl-c"));
        assert!(!chords.is_armed(now));
    }

    #[test]
    fn test_chord_run_and_inspect() {
        let mut chords = ChordState::default();
        let now = Instant::now();
        chords.press(Key::CtrlC, now);
        assert_eq!(chords.press(Key::CtrlL, now).action, Some(CellAction::Run));
        chords.press(Key::CtrlC, now);
        assert_eq!(chords.press(Key::CtrlComma, now).action, Some(CellAction::Inspect));
        // Unarmed second keys do nothing
        assert_eq!(chords.press(Key::CtrlL, now), KeyOutcome::default());
    }

    #[test]
    fn test_chord_window_expires() {
        let mut chords = ChordState::default();
        let now = Instant::now();
        chords.press(Key::CtrlC, now);
        let late = now + CHORD_WINDOW + Duration::from_millis(1);
        assert_eq!(chords.deadline(), Some(now + CHORD_WINDOW));
        // A late Ctrl-C re-arms instead of completing
        assert_eq!(chords.press(Key::CtrlC, late).action, None);
        assert!(chords.expire(late + CHORD_WINDOW));
        assert!(!chords.expire(late + CHORD_WINDOW));
    }
}
