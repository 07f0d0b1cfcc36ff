//! Trouble-code packing helpers.
//!
//! Mode 03 reports each stored code as two bytes. The top two bits of the
//! first byte select the system letter, the remaining nibbles are the four
//! code digits.

/// Render a two-byte DTC as its code string, e.g. `(0x03, 0x00)` -> "P0300"
pub fn dtc_code_string(high: u8, low: u8) -> String {
    let prefix = match (high >> 6) & 0x03 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    let second = (high >> 4) & 0x03;
    let third = high & 0x0F;
    let fourth = (low >> 4) & 0x0F;
    let fifth = low & 0x0F;
    format!("{prefix}{second:01X}{third:01X}{fourth:01X}{fifth:01X}")
}

/// Pack a code string back into its two wire bytes.
///
/// Inverse of [`dtc_code_string`]; used by simulated devices. Returns None
/// for strings that are not well-formed codes.
pub fn dtc_code_bytes(code: &str) -> Option<(u8, u8)> {
    let mut chars = code.chars();
    let system = match chars.next()? {
        'P' => 0u8,
        'C' => 1,
        'B' => 2,
        'U' => 3,
        _ => return None,
    };
    let digits = chars
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<Vec<u8>>>()?;
    if digits.len() != 4 || digits[0] > 3 {
        return None;
    }
    let high = (system << 6) | (digits[0] << 4) | digits[1];
    let low = (digits[2] << 4) | digits[3];
    Some((high, low))
}

/// Codes in the manufacturer-defined ranges (second character 1 or 3)
pub fn is_manufacturer_specific(code: &str) -> bool {
    matches!(code.as_bytes().get(1), Some(b'1') | Some(b'3'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_string_powertrain() {
        assert_eq!(dtc_code_string(0x03, 0x00), "P0300");
        assert_eq!(dtc_code_string(0x01, 0x01), "P0101");
    }

    #[test]
    fn test_code_string_other_systems() {
        assert_eq!(dtc_code_string(0x44, 0x20), "C0420");
        assert_eq!(dtc_code_string(0x92, 0x34), "B1234");
        assert_eq!(dtc_code_string(0xC1, 0x00), "U0100");
    }

    #[test]
    fn test_code_bytes_round_trip() {
        for code in ["P0300", "P0101", "C0420", "B1234", "U0100", "P1DF0"] {
            let (high, low) = dtc_code_bytes(code).unwrap();
            assert_eq!(dtc_code_string(high, low), code);
        }
    }

    #[test]
    fn test_code_bytes_rejects_garbage() {
        assert_eq!(dtc_code_bytes("X0100"), None);
        assert_eq!(dtc_code_bytes("P01"), None);
        assert_eq!(dtc_code_bytes("P9999"), None);
    }

    #[test]
    fn test_manufacturer_ranges() {
        assert!(is_manufacturer_specific("P1101"));
        assert!(is_manufacturer_specific("U3000"));
        assert!(!is_manufacturer_specific("P0300"));
        assert!(!is_manufacturer_specific("C0420"));
    }
}
