/* Taken from: https://www.m-bus.de/man.html */
pub fn get_manufacturer(lo: u8, hi: u8) -> String {
    let m: u16 = (hi as u16) << 8 | lo as u16;

    return [(m >> 10) & 0x1F, (m >> 5) & 0x1F, m & 0x1F]
        .iter()
        .map(|c| char::from((*c as u8) + 64))
        .collect();
}

/// Decodes little endian packed BCD, returns None if a nibble is not a decimal digit
pub fn bcd_to_u64(bytes: &[u8]) -> Option<u64> {
    let mut result: u64 = 0;
    for byte in bytes.iter().rev() {
        let high = (byte >> 4) & 0x0F;
        let low = byte & 0x0F;
        if high > 9 || low > 9 {
            return None;
        }
        result = result * 100 + (high * 10 + low) as u64;
    }
    return Some(result);
}

pub fn get_device_medium(medium: u8) -> String {
    return match medium {
        0x00 => "Other",
        0x01 => "Oil",
        0x02 => "Electricity",
        0x03 => "Gas",
        0x04 => "Heat (outlet)",
        0x05 => "Steam",
        0x06 => "Water (hot)",
        0x07 => "Water",
        0x08 => "Heat Cost Allocator",
        0x09 => "Compressed Air",
        0x0A => "Cooling (outlet)",
        0x0B => "Cooling (inlet)",
        0x0C => "Heat (inlet)",
        0x0D => "Heat / Cooling Combined",
        0x0E => "Bus / System",
        0x15 => "Water (hot)",
        0x16 => "Water (cold)",
        0x17 => "Water (dual)",
        0x18 => "Pressure",
        0x19 => "A/D Converter",
        _ => "unknown",
    }.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_manufacturer() {
        /* 0x1593 is ELS, as used in the OMS Annex N examples */
        assert_eq!(get_manufacturer(0x93, 0x15), "ELS");
        /* 0x4024 is PAD */
        assert_eq!(get_manufacturer(0x24, 0x40), "PAD");
    }

    #[test]
    fn test_bcd_to_u64() {
        assert_eq!(bcd_to_u64(&[0x78, 0x56, 0x34, 0x12]), Some(12345678));
        assert_eq!(bcd_to_u64(&[0x01]), Some(1));
        assert_eq!(bcd_to_u64(&[0x1A]), None);
    }

    #[test]
    fn test_get_device_medium() {
        assert_eq!(get_device_medium(0x07), "Water");
        assert_eq!(get_device_medium(0x02), "Electricity");
        assert_eq!(get_device_medium(0x42), "unknown");
    }
}
