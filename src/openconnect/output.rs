//! Recognising openconnect progress messages

/// Lowercased fragments openconnect prints once the tunnel is usable
const READY_MARKERS: &[&str] = &[
    "configured as ",
    "connected as ",
    "established dtls connection",
    "esp session established",
    "continuing in background",
];

/// Whether an output line means the tunnel is up.
pub fn is_ready_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    READY_MARKERS.iter().any(|marker| lower.contains(marker))
}
