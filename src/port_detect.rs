use glob::glob;

/// Where FTDI and CDC adapters (MEGA65 JTAG, Nexys boards) show up.
const PATTERNS: &[&str] = &[
    "/dev/cu.usbserial*",
    "/dev/cu.usbmodem*",
    "/dev/tty.usbserial*",
    "/dev/tty.usbmodem*",
    "/dev/ttyUSB*",
    "/dev/ttyACM*",
];

pub fn list_candidates() -> Vec<String> {
    let mut out = Vec::new();
    for pattern in PATTERNS {
        let Ok(entries) = glob(pattern) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.display().to_string();
            if !out.iter().any(|existing| existing == &path) {
                out.push(path);
            }
        }
    }
    out
}

/// The only candidate matching `hint`, preferring macOS call-out devices and
/// then Linux USB ttys when a family has exactly one member.
pub fn pick_port(candidates: &[String], hint: Option<&str>) -> Option<String> {
    let candidates: Vec<&String> = candidates
        .iter()
        .filter(|c| hint.is_none_or(|hint| c.contains(hint)))
        .collect();

    let families: [fn(&str) -> bool; 3] = [is_call_out, is_linux_usb, is_macos_tty];
    for family in families {
        let mut members = candidates.iter().filter(|c| family(c.as_str()));
        if let (Some(only), None) = (members.next(), members.next()) {
            return Some((*only).clone());
        }
    }

    match candidates.as_slice() {
        [only] => Some((*only).clone()),
        _ => None,
    }
}

fn is_call_out(path: &str) -> bool {
    path.starts_with("/dev/cu.")
}

fn is_linux_usb(path: &str) -> bool {
    path.starts_with("/dev/ttyUSB") || path.starts_with("/dev/ttyACM")
}

fn is_macos_tty(path: &str) -> bool {
    path.starts_with("/dev/tty.")
}
