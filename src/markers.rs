//! Marker grammar for DUT standard output
//!
//! The DUT announces protocol milestones as free-text lines. Scenarios match
//! them by substring, except for the passkey, which travels as a
//! `PK<digits>` token and is extracted with a small regular expression.
//!
//! In the other direction a passkey is typed into the DUT by writing
//! `PK<zero-padded digits>PK` followed by a newline to its standard input.

use std::sync::OnceLock;

use regex::Regex;

pub use crate::hci::REASON_AUTHENTICATION_FAILURE;

/// Printed once the DUT has completed pairing and stored the bond.
pub const BONDED_MARKER: &str = "Paired. bonded=1";

/// Suffix of every disconnect line, e.g. `reason 5: Disconnected.`.
pub const DISCONNECTED_MARKER: &str = "Disconnected.";

/// Printed when the DUT, scanning, finds an advertiser with another name.
pub const PEER_NAME_WRONG_MARKER: &str = "Peer name wrong.";

/// Default passkey width.
pub const PASSKEY_DIGITS: usize = 6;

fn passkey_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"PK<(\d+)>").expect("valid passkey pattern"))
}

fn typed_passkey_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"PK(\d+)PK").expect("valid typed passkey pattern"))
}

fn disconnect_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"reason (\d+): Disconnected\.").expect("valid disconnect pattern")
    })
}

/// A recognised milestone in one line of DUT output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Bonded,
    Passkey(u32),
    /// A `PK<digits>PK` line typed into the DUT and echoed on its console.
    PasskeyTyped(u32),
    Disconnected { reason: Option<u8> },
    PeerNameWrong,
}

/// Classify a line. Lines without a known marker yield `None`.
pub fn classify(line: &str) -> Option<Marker> {
    if let Some(value) = parse_passkey(line) {
        return Some(Marker::Passkey(value));
    }
    if let Some(value) = parse_typed_passkey(line) {
        return Some(Marker::PasskeyTyped(value));
    }
    if line.contains(BONDED_MARKER) {
        return Some(Marker::Bonded);
    }
    if line.contains(DISCONNECTED_MARKER) {
        return Some(Marker::Disconnected {
            reason: disconnect_reason(line),
        });
    }
    if line.contains(PEER_NAME_WRONG_MARKER) {
        return Some(Marker::PeerNameWrong);
    }
    None
}

/// Extract the value of a `PK<digits>` token. Values that do not fit in a
/// `u32` are treated as absent.
pub fn parse_passkey(line: &str) -> Option<u32> {
    passkey_pattern()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extract the value of a typed `PK<digits>PK` line.
pub fn parse_typed_passkey(line: &str) -> Option<u32> {
    typed_passkey_pattern()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extract the numeric reason from a `reason N: Disconnected.` line.
pub fn disconnect_reason(line: &str) -> Option<u8> {
    disconnect_pattern()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// The stdin line that types `value` into the DUT.
pub fn format_passkey_line(value: u32, digits: usize) -> String {
    format!("PK{:0width$}PK\n", value, width = digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_passkey() {
        assert_eq!(parse_passkey("PK<654321>"), Some(654321));
        assert_eq!(parse_passkey("[00:00:01.000] <inf> app: PK<000042>"), Some(42));
        assert_eq!(parse_passkey("PK<>"), None);
        assert_eq!(parse_passkey("PK654321"), None);
        assert_eq!(parse_passkey("PK<99999999999>"), None);
    }

    #[test]
    fn test_typed_passkey_round_trip() {
        let line = format_passkey_line(42, PASSKEY_DIGITS);
        assert_eq!(line, "PK000042PK\n");
        assert_eq!(parse_typed_passkey(line.trim_end()), Some(42));
        assert_eq!(classify("PK000042PK"), Some(Marker::PasskeyTyped(42)));
        assert_eq!(parse_typed_passkey("PK<000042>"), None);
    }

    #[test]
    fn test_disconnect_reason() {
        assert_eq!(
            disconnect_reason("bt_conn_loop: reason 5: Disconnected."),
            Some(REASON_AUTHENTICATION_FAILURE)
        );
        assert_eq!(disconnect_reason("bt_conn_loop: Disconnected."), None);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("bt_conn_loop: Paired. bonded=1"), Some(Marker::Bonded));
        assert_eq!(classify("PK<654321>"), Some(Marker::Passkey(654321)));
        assert_eq!(
            classify("bt_conn_loop: reason 19: Disconnected."),
            Some(Marker::Disconnected { reason: Some(19) })
        );
        assert_eq!(
            classify("bt_conn_loop: device_found: Peer name wrong."),
            Some(Marker::PeerNameWrong)
        );
        assert_eq!(classify("Paired. bonded=0"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn test_format_passkey_line() {
        assert_eq!(format_passkey_line(42, PASSKEY_DIGITS), "PK000042PK\n");
        assert_eq!(format_passkey_line(654321, PASSKEY_DIGITS), "PK654321PK\n");
        assert_eq!(format_passkey_line(7, 4), "PK0007PK\n");
    }
}
