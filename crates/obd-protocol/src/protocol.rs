//! OBD-II Protocol Selection
//!
//! Maps between the ELM327 protocol numbers used by `ATSP` / `AT DPN` and
//! the bus protocols they stand for.

use serde::{Deserialize, Serialize};

/// Bus protocols an ELM327 can be told to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    /// ELM327 protocol number (the digit after `ATSP`)
    pub fn number(&self) -> u8 {
        match self {
            ObdProtocol::Auto => 0,
            ObdProtocol::J1850Pwm => 1,
            ObdProtocol::J1850Vpw => 2,
            ObdProtocol::Iso9141_2 => 3,
            ObdProtocol::Iso14230_4Kwp => 4,
            ObdProtocol::Iso14230_4KwpFast => 5,
            ObdProtocol::Iso15765_4Can11bit500 => 6,
            ObdProtocol::Iso15765_4Can29bit500 => 7,
            ObdProtocol::Iso15765_4Can11bit250 => 8,
            ObdProtocol::Iso15765_4Can29bit250 => 9,
        }
    }

    /// Inverse of [`ObdProtocol::number`]
    pub fn from_number(number: u8) -> Option<Self> {
        let protocol = match number {
            0 => ObdProtocol::Auto,
            1 => ObdProtocol::J1850Pwm,
            2 => ObdProtocol::J1850Vpw,
            3 => ObdProtocol::Iso9141_2,
            4 => ObdProtocol::Iso14230_4Kwp,
            5 => ObdProtocol::Iso14230_4KwpFast,
            6 => ObdProtocol::Iso15765_4Can11bit500,
            7 => ObdProtocol::Iso15765_4Can29bit500,
            8 => ObdProtocol::Iso15765_4Can11bit250,
            9 => ObdProtocol::Iso15765_4Can29bit250,
            _ => return None,
        };
        Some(protocol)
    }

    /// Get the ELM327 AT command selecting this protocol
    pub fn to_elm_command(&self) -> String {
        format!("ATSP{}", self.number())
    }

    /// Parse an `AT DPN` reply such as `A6` (auto, settled on 6) or `7`.
    ///
    /// Returns the protocol and whether the adapter chose it automatically.
    pub fn from_dpn(reply: &str) -> Option<(Self, bool)> {
        let reply = reply.trim();
        let (automatic, digit) = match reply.strip_prefix('A') {
            Some(rest) => (true, rest),
            None => (false, reply),
        };
        let number = digit.parse::<u8>().ok()?;
        Self::from_number(number).map(|protocol| (protocol, automatic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elm_command() {
        assert_eq!(ObdProtocol::Auto.to_elm_command(), "ATSP0");
        assert_eq!(ObdProtocol::Iso15765_4Can29bit500.to_elm_command(), "ATSP7");
    }

    #[test]
    fn test_dpn_reply() {
        assert_eq!(
            ObdProtocol::from_dpn("A6"),
            Some((ObdProtocol::Iso15765_4Can11bit500, true))
        );
        assert_eq!(
            ObdProtocol::from_dpn("3"),
            Some((ObdProtocol::Iso9141_2, false))
        );
        assert_eq!(ObdProtocol::from_dpn("OK"), None);
    }
}
