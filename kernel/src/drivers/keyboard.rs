//! PS/2 keyboard driver.
//!
//! Scancodes are decoded in interrupt context and fed into the *displayed*
//! terminal's line buffer, which need not be the executing one. Alt+F1..F3
//! switch the displayed terminal, Ctrl+L clears it; everything else goes
//! through the layout decoder.

#![allow(static_mut_refs)]

use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, KeyState, Keyboard, ScancodeSet1};
use x86_64::instructions::port::Port;

use crate::terminal;

const DATA_PORT: u16 = 0x60;

struct KeyboardState {
    decoder: Option<Keyboard<layouts::Us104Key, ScancodeSet1>>,
    alt: bool,
    ctrl: bool,
}

static mut STATE: KeyboardState = KeyboardState {
    decoder: None,
    alt: false,
    ctrl: false,
};

pub fn init() {
    unsafe {
        STATE.decoder = Some(Keyboard::new(
            layouts::Us104Key,
            ScancodeSet1,
            HandleControl::Ignore,
        ));
    }
}

/// IRQ1 body: read and decode one scancode. Runs with interrupts disabled.
pub fn on_interrupt() {
    let scancode = unsafe { Port::<u8>::new(DATA_PORT).read() };
    handle_scancode(scancode);
}

fn handle_scancode(scancode: u8) {
    unsafe {
        let decoder = match STATE.decoder.as_mut() {
            Some(d) => d,
            None => return,
        };
        let event = match decoder.add_byte(scancode) {
            Ok(Some(ev)) => ev,
            _ => return,
        };

        let code = event.code;
        let down = event.state == KeyState::Down;
        match code {
            KeyCode::AltLeft | KeyCode::AltRight => STATE.alt = down,
            KeyCode::ControlLeft | KeyCode::ControlRight => STATE.ctrl = down,
            _ => {}
        }

        if down && STATE.alt {
            let target = match code {
                KeyCode::F1 => Some(0),
                KeyCode::F2 => Some(1),
                KeyCode::F3 => Some(2),
                _ => None,
            };
            if let Some(id) = target {
                terminal::switch_displayed(id);
                return;
            }
        }
        if down && STATE.ctrl && code == KeyCode::L {
            terminal::clear_displayed();
            return;
        }

        if let Some(DecodedKey::Unicode(c)) = decoder.process_keyevent(event) {
            match c {
                '\n' | '\r' => terminal::handle_input_byte(b'\n'),
                '\x08' => terminal::handle_input_byte(0x08),
                c if c.is_ascii() && !c.is_control() => terminal::handle_input_byte(c as u8),
                _ => {}
            }
        }
    }
}
