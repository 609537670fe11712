//! MicroPython program synthesis for the App 3 firmware.
//!
//! The hub runs whatever source lands in a slot, so every host-side
//! action becomes a tiny generated program. App 3 API rules the
//! generators must respect: `sound.beep()` and `light_matrix.write()`
//! are async and need `runloop.run(main())`; `light_matrix.set_pixel()`
//! and `light_matrix.clear()` are sync. Pixel patterns keep the display
//! lit with a sleep loop since the matrix clears when the program exits.

use std::fmt::Write as _;

/// 5x5 LED matrix patterns as lit (x, y) coordinates.
pub const PATTERNS: &[(&str, &[(u8, u8)])] = &[
    (
        "happy",
        &[(1, 1), (3, 1), (0, 3), (4, 3), (1, 4), (2, 4), (3, 4)],
    ),
    (
        "sad",
        &[(1, 1), (3, 1), (1, 3), (2, 3), (3, 3), (0, 4), (4, 4)],
    ),
    ("neutral", &[(1, 1), (3, 1), (1, 3), (2, 3), (3, 3)]),
    (
        "angry",
        &[
            (0, 0),
            (1, 1),
            (4, 0),
            (3, 1),
            (1, 3),
            (2, 3),
            (3, 3),
            (0, 4),
            (4, 4),
        ],
    ),
    (
        "surprised",
        &[
            (1, 1),
            (3, 1),
            (1, 3),
            (2, 3),
            (3, 3),
            (1, 4),
            (3, 4),
            (2, 2),
        ],
    ),
    (
        "heart",
        &[
            (1, 0),
            (3, 0),
            (0, 1),
            (2, 1),
            (4, 1),
            (0, 2),
            (4, 2),
            (1, 3),
            (3, 3),
            (2, 4),
        ],
    ),
    ("check", &[(4, 0), (3, 1), (2, 2), (1, 3), (0, 2)]),
    (
        "x",
        &[
            (0, 0),
            (4, 0),
            (1, 1),
            (3, 1),
            (2, 2),
            (1, 3),
            (3, 3),
            (0, 4),
            (4, 4),
        ],
    ),
];

/// Melodies as (frequency Hz, duration ms) notes. Frequency 0 is a rest.
pub const MELODIES: &[(&str, &[(u16, u16)])] = &[
    ("happy", &[(523, 150), (659, 150), (784, 300)]),
    ("sad", &[(392, 300), (349, 300), (330, 400)]),
    ("alert", &[(880, 100), (0, 50), (880, 100)]),
    (
        "success",
        &[(523, 150), (659, 150), (784, 150), (1047, 300)],
    ),
    ("error", &[(200, 300), (150, 300)]),
    ("startup", &[(262, 100), (330, 100), (392, 100), (523, 200)]),
];

pub fn pattern(name: &str) -> Option<&'static [(u8, u8)]> {
    PATTERNS.iter().find(|(n, _)| *n == name).map(|(_, p)| *p)
}

pub fn melody(name: &str) -> Option<&'static [(u16, u16)]> {
    MELODIES.iter().find(|(n, _)| *n == name).map(|(_, m)| *m)
}

/// Single beep at max volume.
pub fn beep(frequency: u16, duration_ms: u32) -> Vec<u8> {
    format!(
        "import runloop\n\
         from hub import sound\n\
         sound.volume(100)\n\
         \n\
         async def main():\n\
         \x20   await sound.beep({frequency}, {duration_ms})\n\
         \n\
         runloop.run(main())\n"
    )
    .into_bytes()
}

/// Sequence of beeps played back to back.
pub fn melody_program(notes: &[(u16, u16)]) -> Vec<u8> {
    let mut body = String::new();
    for (freq, dur) in notes {
        let _ = writeln!(body, "    await sound.beep({freq}, {dur})");
    }
    format!(
        "import runloop\n\
         from hub import sound\n\
         sound.volume(100)\n\
         \n\
         async def main():\n\
         {body}\
         \n\
         runloop.run(main())\n"
    )
    .into_bytes()
}

/// Display a named pattern, or scroll arbitrary text when the name is
/// not a known pattern.
pub fn display(name: &str) -> Vec<u8> {
    let Some(pixels) = pattern(name) else {
        return format!(
            "import runloop\n\
             from hub import light_matrix\n\
             \n\
             async def main():\n\
             \x20   await light_matrix.write(\"{name}\")\n\
             \n\
             runloop.run(main())\n"
        )
        .into_bytes();
    };
    let mut pixel_code = String::new();
    for (x, y) in pixels {
        let _ = writeln!(pixel_code, "light_matrix.set_pixel({x}, {y}, 100)");
    }
    format!(
        "from hub import light_matrix\n\
         import time\n\
         \n\
         light_matrix.clear()\n\
         {pixel_code}\
         \n\
         while True:\n\
         \x20   time.sleep(1)\n"
    )
    .into_bytes()
}

pub fn clear_display() -> Vec<u8> {
    b"from hub import light_matrix\nlight_matrix.clear()\n".to_vec()
}

/// A no-op slot used to silence the hub.
pub fn noop() -> Vec<u8> {
    b"pass\n".to_vec()
}

/// Builtin actions pre-uploaded at connect, in slot order.
pub fn builtin_actions() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("beep_high", beep(880, 300)),
        ("beep_med", beep(440, 300)),
        ("beep_low", beep(220, 300)),
        ("beep_c", beep(523, 300)),
        ("beep_e", beep(659, 300)),
        ("beep_g", beep(784, 300)),
        ("happy", display("happy")),
        ("sad", display("sad")),
        ("heart", display("heart")),
        ("neutral", display("neutral")),
        ("angry", display("angry")),
        ("surprised", display("surprised")),
        ("check", display("check")),
        ("clear", clear_display()),
        ("stop", noop()),
    ]
}

/// One step of a batched or interactive sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceAction {
    Beep { frequency: u16, duration_ms: u32 },
    Display(String),
    Delay(u32),
}

fn sequence_header(body: &mut String) {
    body.push_str("import runloop\n");
    body.push_str("from hub import sound, light_matrix\n");
    body.push_str("import time\n");
    body.push_str("sound.volume(100)\n");
    body.push('\n');
    body.push_str("async def main():\n");
}

fn action_line(body: &mut String, action: &SequenceAction) {
    match action {
        SequenceAction::Beep {
            frequency,
            duration_ms,
        } => {
            let _ = writeln!(body, "    await sound.beep({frequency}, {duration_ms})");
        }
        SequenceAction::Display(text) => {
            let _ = writeln!(body, "    await light_matrix.write(\"{text}\")");
        }
        SequenceAction::Delay(ms) => {
            let _ = writeln!(body, "    time.sleep({})", f64::from(*ms) / 1000.0);
        }
    }
}

/// Whole sequence as one program, so the hub plays its startup melody
/// once instead of once per action.
pub fn sequence(actions: &[SequenceAction], gap_ms: u32) -> Vec<u8> {
    let mut body = String::new();
    sequence_header(&mut body);
    for action in actions {
        action_line(&mut body, action);
        if gap_ms > 0 {
            let _ = writeln!(body, "    time.sleep({})", f64::from(gap_ms) / 1000.0);
        }
    }
    body.push('\n');
    body.push_str("runloop.run(main())\n");
    body.into_bytes()
}

/// Sequence that prints `DONE:<index>` after every step so the host can
/// react between actions. The one-second sleep after each print gives
/// the host time to drive other devices before the next step fires.
pub fn interactive_sequence(actions: &[SequenceAction]) -> Vec<u8> {
    let mut body = String::new();
    sequence_header(&mut body);
    for (i, action) in actions.iter().enumerate() {
        action_line(&mut body, action);
        let _ = writeln!(body, "    print(\"DONE:{i}\")");
        body.push_str("    time.sleep(1.0)\n");
    }
    body.push('\n');
    body.push_str("runloop.run(main())\n");
    body.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beep_program_shape() {
        let text = String::from_utf8(beep(880, 300)).unwrap();
        assert_eq!(
            text,
            "import runloop\n\
             from hub import sound\n\
             sound.volume(100)\n\
             \n\
             async def main():\n\
             \x20   await sound.beep(880, 300)\n\
             \n\
             runloop.run(main())\n"
        );
    }

    #[test]
    fn named_pattern_uses_sync_pixels_and_keepalive() {
        let text = String::from_utf8(display("heart")).unwrap();
        assert!(text.contains("light_matrix.set_pixel(2, 4, 100)"));
        assert!(text.contains("while True:"));
        assert!(!text.contains("runloop"));
    }

    #[test]
    fn unknown_pattern_scrolls_as_text() {
        let text = String::from_utf8(display("Hi!")).unwrap();
        assert!(text.contains("await light_matrix.write(\"Hi!\")"));
        assert!(text.contains("runloop.run(main())"));
    }

    #[test]
    fn sequence_is_one_program_with_gaps() {
        let program = sequence(
            &[
                SequenceAction::Beep {
                    frequency: 880,
                    duration_ms: 200,
                },
                SequenceAction::Display("Hi".into()),
                SequenceAction::Delay(250),
            ],
            100,
        );
        let text = String::from_utf8(program).unwrap();
        assert_eq!(text.matches("runloop.run(main())").count(), 1);
        assert!(text.contains("await sound.beep(880, 200)"));
        assert!(text.contains("await light_matrix.write(\"Hi\")"));
        assert!(text.contains("time.sleep(0.25)"));
        assert_eq!(text.matches("time.sleep(0.1)").count(), 3);
    }

    #[test]
    fn interactive_sequence_signals_each_step() {
        let actions = vec![
            SequenceAction::Beep {
                frequency: 440,
                duration_ms: 200,
            },
            SequenceAction::Beep {
                frequency: 880,
                duration_ms: 200,
            },
        ];
        let text = String::from_utf8(interactive_sequence(&actions)).unwrap();
        assert!(text.contains("print(\"DONE:0\")"));
        assert!(text.contains("print(\"DONE:1\")"));
        assert_eq!(text.matches("time.sleep(1.0)").count(), 2);
    }

    #[test]
    fn builtin_actions_cover_beeps_and_faces() {
        let builtins = builtin_actions();
        assert_eq!(builtins[0].0, "beep_high");
        assert!(builtins.iter().any(|(name, _)| *name == "stop"));
        let (_, stop) = builtins.last().unwrap();
        assert_eq!(stop, b"pass\n");
    }

    #[test]
    fn melody_lookup() {
        assert_eq!(melody("alert"), Some([(880, 100), (0, 50), (880, 100)].as_slice()));
        assert!(melody("nope").is_none());
        let text = String::from_utf8(melody_program(melody("sad").unwrap())).unwrap();
        assert!(text.contains("await sound.beep(392, 300)"));
    }
}
