use log::debug;

use super::structs::{DataRecord, RecordFunction};
use super::utils::bcd_to_u64;
use super::FrameError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum DataCoding {
    NoData,
    Integer,
    Real32,
    Bcd,
    NegativeBcd,
    Ascii,
    VariableLength,
}

/* Returns the number of data bytes and how to read them */
fn get_dif_coding(dif: u8) -> (usize, DataCoding) {
    return match dif & 0x0F {
        /* No data and selection for readout */
        0x00 | 0x08 => (0, DataCoding::NoData),
        0x01 => (1, DataCoding::Integer),
        0x02 => (2, DataCoding::Integer),
        0x03 => (3, DataCoding::Integer),
        0x04 => (4, DataCoding::Integer),
        0x05 => (4, DataCoding::Real32),
        0x06 => (6, DataCoding::Integer),
        0x07 => (8, DataCoding::Integer),
        0x09 => (1, DataCoding::Bcd),
        0x0A => (2, DataCoding::Bcd),
        0x0B => (3, DataCoding::Bcd),
        0x0C => (4, DataCoding::Bcd),
        0x0D => (0, DataCoding::VariableLength),
        0x0E => (6, DataCoding::Bcd),
        /* 0x0F are special functions, the caller handles them */
        _ => (0, DataCoding::NoData),
    };
}

fn get_lvar_coding(lvar: u8, offset: usize) -> Result<(usize, DataCoding), FrameError> {
    return match lvar {
        0x00..=0xBF => Ok((lvar as usize, DataCoding::Ascii)),
        0xC0..=0xC9 => Ok(((lvar - 0xC0) as usize, DataCoding::Bcd)),
        0xD0..=0xD9 => Ok(((lvar - 0xD0) as usize, DataCoding::NegativeBcd)),
        0xE0..=0xE8 => Ok(((lvar - 0xE0) as usize, DataCoding::Integer)),
        _ => Err(FrameError::UnsupportedLvar { lvar, offset }),
    };
}

fn read_integer(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut raw: u64 = 0;
    for (i, byte) in data.iter().enumerate() {
        raw |= (*byte as u64) << (8 * i);
    }

    /* Type B, two's complement with the sign in the highest transmitted bit */
    let bits = 8 * data.len();
    if bits < 64 && raw & (1 << (bits - 1)) != 0 {
        return (raw | (u64::MAX << bits)) as i64 as f64;
    }
    return raw as i64 as f64;
}

fn read_bcd(data: &[u8], negative: bool) -> (f64, Option<String>) {
    let mut digits = data.to_vec();
    let mut sign = if negative { -1.0 } else { 1.0 };

    /* A leading 0xF nibble marks a negative value */
    if let Some(last) = digits.last_mut() {
        if *last & 0xF0 == 0xF0 {
            *last &= 0x0F;
            sign = -sign;
        }
    }

    return match bcd_to_u64(&digits) {
        Some(v) => (sign * v as f64, None),
        None => (0.0, Some(format!("invalid BCD {}", hex::encode(data)))),
    };
}

fn read_value(coding: DataCoding, data: &[u8]) -> (f64, Option<String>) {
    return match coding {
        DataCoding::NoData | DataCoding::VariableLength => (0.0, None),
        DataCoding::Integer => (read_integer(data), None),
        DataCoding::Real32 => {
            let bytes = [data[0], data[1], data[2], data[3]];
            (f32::from_le_bytes(bytes) as f64, None)
        }
        DataCoding::Bcd => read_bcd(data, false),
        DataCoding::NegativeBcd => read_bcd(data, true),
        /* Strings are transmitted last character first */
        DataCoding::Ascii => (0.0, Some(data.iter().rev().map(|b| *b as char).collect())),
    };
}

type VifHandler = fn(vif: u8, data: &[u8], value: f64) -> (f64, Option<String>);

struct VifData {
    vif: u8,
    quantity: String,
    scaler: f64,
    unit: String,
    vif_function: Option<VifHandler>,
}

impl VifData {
    fn scaled(vif: u8, quantity: &str, exponent: i32, unit: &str) -> Self {
        return VifData {
            vif,
            quantity: quantity.to_string(),
            scaler: 10f64.powi(exponent),
            unit: unit.to_string(),
            vif_function: None,
        };
    }

    fn handled(vif: u8, quantity: &str, unit: &str, handler: VifHandler) -> Self {
        return VifData {
            vif,
            quantity: quantity.to_string(),
            scaler: 1.0,
            unit: unit.to_string(),
            vif_function: Some(handler),
        };
    }

    fn unknown(vif: u8, table: &str) -> Self {
        return VifData::scaled(vif, &format!("unknown_{table}{vif:02x}"), 0, "unknown");
    }
}

/* nn = 00 seconds, 01 minutes, 10 hours, 11 days; normalized to seconds */
fn parse_duration(vif: u8, _data: &[u8], value: f64) -> (f64, Option<String>) {
    let factor = match vif & 0x03 {
        0b00 => 1.0,
        0b01 => 60.0,
        0b10 => 3600.0,
        _ => 86400.0,
    };
    return (value * factor, None);
}

/*
    Type G date, the year is split over both bytes:
    15 14 13 12 11 10 09 08 07 06 05 04 03 02 01 00
    y6 y5 y4 y3 m3 m2 m1 m0 y2 y1 y0 d4 d3 d2 d1 d0
*/
fn date_type_g(lo: u8, hi: u8) -> String {
    let day = lo & 0x1F;
    let month = hi & 0x0F;
    let year = ((lo & 0xE0) >> 5) as u32 | ((hi & 0xF0) >> 1) as u32;
    /* Two digit years, meters without a century bit wrap at 80 */
    let year = if year <= 80 { 2000 + year } else { 1900 + year };
    return format!("{day:02}.{month:02}.{year:04}");
}

fn parse_time_point(vif: u8, data: &[u8], value: f64) -> (f64, Option<String>) {
    if vif & 0x01 == 1 && data.len() >= 4 {
        /* Type F, minutes and hours in front of a type G date */
        let min = data[0] & 0x3F;
        let hour = data[1] & 0x1F;
        return (value, Some(format!("{} {hour:02}:{min:02}", date_type_g(data[2], data[3]))));
    } else if data.len() >= 2 {
        return (value, Some(date_type_g(data[0], data[1])));
    }
    return (value, None);
}

fn vif_handle_binary(_vif: u8, _data: &[u8], value: f64) -> (f64, Option<String>) {
    return (value, Some(format!("{:X}", value as u64)));
}

fn get_primary_vif(vif: u8) -> VifData {
    let n = (vif & 0x07) as i32;
    let nn = (vif & 0x03) as i32;

    /* Comments from https://m-bus.com/documentation-wired/08-appendix */
    return match vif & 0x7F {
        /* E0000nnn Energy 10(nnn-3) Wh */
        0x00..=0x07 => VifData::scaled(vif, "energy", n - 3, "Wh"),
        /* E0001nnn Energy 10(nnn) J */
        0x08..=0x0F => VifData::scaled(vif, "energy", n, "J"),
        /* E0010nnn Volume 10(nnn-6) m3 */
        0x10..=0x17 => VifData::scaled(vif, "volume", n - 6, "m³"),
        /* E0011nnn Mass 10(nnn-3) kg */
        0x18..=0x1F => VifData::scaled(vif, "mass", n - 3, "kg"),
        /* E01000nn On Time */
        0x20..=0x23 => VifData::handled(vif, "on_time", "s", parse_duration),
        /* E01001nn Operating Time */
        0x24..=0x27 => VifData::handled(vif, "operating_time", "s", parse_duration),
        /* E0101nnn Power 10(nnn-3) W */
        0x28..=0x2F => VifData::scaled(vif, "power", n - 3, "W"),
        /* E0110nnn Power 10(nnn) J/h */
        0x30..=0x37 => VifData::scaled(vif, "power", n, "J/h"),
        /* E0111nnn Volume Flow 10(nnn-6) m3/h */
        0x38..=0x3F => VifData::scaled(vif, "volume_flow", n - 6, "m³/h"),
        /* E1000nnn Volume Flow ext. 10(nnn-7) m3/min */
        0x40..=0x47 => VifData::scaled(vif, "volume_flow_ext", n - 7, "m³/min"),
        /* E1001nnn Volume Flow ext. 10(nnn-9) m3/s */
        0x48..=0x4F => VifData::scaled(vif, "volume_flow_ext", n - 9, "m³/s"),
        /* E1010nnn Mass flow 10(nnn-3) kg/h */
        0x50..=0x57 => VifData::scaled(vif, "mass_flow", n - 3, "kg/h"),
        /* E10110nn Flow Temperature 10(nn-3) °C */
        0x58..=0x5B => VifData::scaled(vif, "flow_temperature", nn - 3, "°C"),
        /* E10111nn Return Temperature 10(nn-3) °C */
        0x5C..=0x5F => VifData::scaled(vif, "return_temperature", nn - 3, "°C"),
        /* E11000nn Temperature Difference 10(nn-3) K */
        0x60..=0x63 => VifData::scaled(vif, "temperature_difference", nn - 3, "K"),
        /* E11001nn External Temperature 10(nn-3) °C */
        0x64..=0x67 => VifData::scaled(vif, "external_temperature", nn - 3, "°C"),
        /* E11010nn Pressure 10(nn-3) bar */
        0x68..=0x6B => VifData::scaled(vif, "pressure", nn - 3, "bar"),
        /* E110110n Time Point, n = 0 date (type G), n = 1 time & date (type F) */
        0x6C..=0x6D => VifData::handled(vif, "time_point", "", parse_time_point),
        /* E1101110 Units for H.C.A. */
        0x6E => VifData::scaled(vif, "hca_units", 0, ""),
        /* E11100nn Averaging Duration, coded like On Time */
        0x70..=0x73 => VifData::handled(vif, "averaging_duration", "s", parse_duration),
        /* E11101nn Actuality Duration, coded like On Time */
        0x74..=0x77 => VifData::handled(vif, "actuality_duration", "s", parse_duration),
        0x78 => VifData::scaled(vif, "fabrication_number", 0, ""),
        0x79 => VifData::scaled(vif, "enhanced_identification", 0, ""),
        0x7A => VifData::scaled(vif, "bus_address", 0, ""),
        /* Plain text VIF, the unit is filled in by the caller */
        0x7C => VifData::scaled(vif, "custom", 0, ""),
        0x7E => VifData::scaled(vif, "any", 0, ""),
        0x7F => VifData::scaled(vif, "manufacturer_specific", 0, ""),
        _ => VifData::unknown(vif, ""),
    };
}

fn get_vif_extension_fb(vif: u8) -> VifData {
    let n = (vif & 0x01) as i32;
    let nn = (vif & 0x03) as i32;
    let nnn = (vif & 0x07) as i32;

    return match vif & 0x7F {
        /* E000000n Energy 10(n-1) MWh */
        0x00..=0x01 => VifData::scaled(vif, "energy", n - 1, "MWh"),
        /* E000100n Energy 10(n-1) GJ */
        0x08..=0x09 => VifData::scaled(vif, "energy", n - 1, "GJ"),
        /* E001000n Volume 10(n+2) m3 */
        0x10..=0x11 => VifData::scaled(vif, "volume", n + 2, "m³"),
        /* E001100n Mass 10(n+2) t */
        0x18..=0x19 => VifData::scaled(vif, "mass", n + 2, "t"),
        0x21 => VifData::scaled(vif, "volume", -1, "feet³"),
        0x22 => VifData::scaled(vif, "volume", -1, "american_gallon"),
        0x23 => VifData::scaled(vif, "volume", 0, "american_gallon"),
        0x24 => VifData::scaled(vif, "volume_flow", -3, "american_gallon/min"),
        0x25 => VifData::scaled(vif, "volume_flow", 0, "american_gallon/min"),
        0x26 => VifData::scaled(vif, "volume_flow", 0, "american_gallon/h"),
        /* E010100n Power 10(n-1) MW */
        0x28..=0x29 => VifData::scaled(vif, "power", n - 1, "MW"),
        /* E011000n Power 10(n-1) GJ/h */
        0x30..=0x31 => VifData::scaled(vif, "power", n - 1, "GJ/h"),
        0x58..=0x5B => VifData::scaled(vif, "flow_temperature", nn - 3, "°F"),
        0x5C..=0x5F => VifData::scaled(vif, "return_temperature", nn - 3, "°F"),
        0x60..=0x63 => VifData::scaled(vif, "temperature_difference", nn - 3, "°F"),
        0x64..=0x67 => VifData::scaled(vif, "external_temperature", nn - 3, "°F"),
        0x70..=0x73 => VifData::scaled(vif, "cold_warm_temperature_limit", nn - 3, "°F"),
        0x74..=0x77 => VifData::scaled(vif, "cold_warm_temperature_limit", nn - 3, "°C"),
        /* E1111nnn cumul. count max power 10(nnn-3) W */
        0x78..=0x7F => VifData::scaled(vif, "cumul_count_max_power", nnn - 3, "W"),
        _ => VifData::unknown(vif, "fb"),
    };
}

fn get_vif_extension_fd(vif: u8) -> VifData {
    let nn = (vif & 0x03) as i32;
    let nnnn = (vif & 0x0F) as i32;

    return match vif & 0x7F {
        0x00..=0x03 => VifData::scaled(vif, "credit", nn - 3, "currency_units"),
        0x04..=0x07 => VifData::scaled(vif, "debit", nn - 3, "currency_units"),
        0x08 => VifData::scaled(vif, "access_number", 0, "count"),
        0x09 => VifData::scaled(vif, "medium", 0, ""),
        0x0A => VifData::scaled(vif, "manufacturer", 0, ""),
        0x0B => VifData::scaled(vif, "parameter_set_identification", 0, ""),
        0x0C => VifData::scaled(vif, "model_version", 0, ""),
        0x0D => VifData::scaled(vif, "hardware_version", 0, ""),
        0x0E => VifData::scaled(vif, "firmware_version", 0, ""),
        0x0F => VifData::scaled(vif, "software_version", 0, ""),
        0x10 => VifData::scaled(vif, "customer_location", 0, ""),
        0x11 => VifData::scaled(vif, "customer", 0, ""),
        0x16 => VifData::scaled(vif, "password", 0, ""),
        0x17 => VifData::handled(vif, "error_flags", "", vif_handle_binary),
        0x18 => VifData::scaled(vif, "error_mask", 0, ""),
        0x1A => VifData::handled(vif, "digital_output", "", vif_handle_binary),
        0x1B => VifData::handled(vif, "digital_input", "", vif_handle_binary),
        0x1C => VifData::scaled(vif, "baudrate", 0, "Baud"),
        0x1D => VifData::scaled(vif, "response_delay_time", 0, "bittimes"),
        0x1E => VifData::scaled(vif, "retry", 0, ""),
        0x24..=0x27 => VifData::handled(vif, "storage_interval", "s", parse_duration),
        0x2C..=0x2F => VifData::handled(vif, "duration_since_last_readout", "s", parse_duration),
        0x3A => VifData::scaled(vif, "dimensionless", 0, ""),
        /* E100nnnn 10(nnnn-9) V */
        0x40..=0x4F => VifData::scaled(vif, "voltage", nnnn - 9, "V"),
        /* E101nnnn 10(nnnn-12) A */
        0x50..=0x5F => VifData::scaled(vif, "current", nnnn - 12, "A"),
        0x60 => VifData::scaled(vif, "reset_counter", 0, ""),
        0x61 => VifData::scaled(vif, "cumulation_counter", 0, ""),
        0x74 => VifData::scaled(vif, "remaining_battery_life", 0, "d"),
        _ => VifData::unknown(vif, "fd"),
    };
}

/* Returns the number of VIF/VIFE bytes consumed and the description of the value */
fn get_vif_function(payload: &[u8], cur_pos: usize, offset: usize) -> Result<(usize, VifData), FrameError> {
    let byte_at = |pos: usize| payload.get(pos).copied().ok_or(FrameError::RecordTruncated(offset));

    let vif = byte_at(cur_pos)?;
    let mut consumed = 1;

    let (mut vif_data, mut extension) = if vif == 0xFB || vif == 0xFD {
        let ext = byte_at(cur_pos + consumed)?;
        consumed += 1;
        let data = match vif {
            0xFB => get_vif_extension_fb(ext),
            _ => get_vif_extension_fd(ext),
        };
        (data, ext & 0x80 != 0)
    } else {
        (get_primary_vif(vif), vif & 0x80 != 0)
    };

    /* The plain text unit follows the VIF directly, VIFEs come after it */
    if vif & 0x7F == 0x7C {
        let len = byte_at(cur_pos + consumed)? as usize;
        consumed += 1;
        let start = cur_pos + consumed;
        let unit = payload.get(start..start + len).ok_or(FrameError::RecordTruncated(offset))?;
        vif_data.unit = unit.iter().rev().map(|b| *b as char).collect();
        consumed += len;
    }

    /* Combinable VIFEs, only the multiplicative correction changes the value */
    while extension {
        let vife = byte_at(cur_pos + consumed)?;
        consumed += 1;
        if (0x70..=0x77).contains(&(vife & 0x7F)) {
            vif_data.scaler *= 10f64.powi((vife & 0x07) as i32 - 6);
        }
        extension = vife & 0x80 != 0;
    }

    return Ok((consumed, vif_data));
}

/// Parses the variable data records following the fixed data header of a RSP_UD telegram
pub fn parse_records(payload: &[u8]) -> Result<Vec<DataRecord>, FrameError> {
    let mut records = Vec::new();

    let mut cur_pos: usize = 0;
    while cur_pos < payload.len() {
        let offset = cur_pos;
        let dif = payload[cur_pos];
        cur_pos += 1;

        match dif {
            /* Idle filler */
            0x2F => continue,
            /* Manufacturer specific data up to the end, 0x1F announces more records in the next telegram */
            0x0F | 0x1F => {
                debug!("Manufacturer specific data with {} bytes skipped", payload.len() - cur_pos);
                break;
            }
            _ if dif & 0x0F == 0x0F => return Err(FrameError::UnsupportedDif { dif, offset }),
            _ => {}
        }

        /* Storage number LSB sits in the DIF, every DIFE adds four bits */
        let mut storage_number = ((dif >> 6) & 0x01) as u64;
        let mut extension = dif & 0x80 != 0;
        let mut dife_count = 0;
        while extension {
            let dife = *payload.get(cur_pos).ok_or(FrameError::RecordTruncated(offset))?;
            cur_pos += 1;
            if dife_count < 15 {
                storage_number |= ((dife & 0x0F) as u64) << (1 + 4 * dife_count);
            }
            dife_count += 1;
            extension = dife & 0x80 != 0;
        }

        let (consumed, vif_data) = get_vif_function(payload, cur_pos, offset)?;
        cur_pos += consumed;

        let (len, coding) = match get_dif_coding(dif) {
            (_, DataCoding::VariableLength) => {
                let lvar = *payload.get(cur_pos).ok_or(FrameError::RecordTruncated(offset))?;
                cur_pos += 1;
                get_lvar_coding(lvar, offset)?
            }
            c => c,
        };

        let data = payload.get(cur_pos..cur_pos + len).ok_or(FrameError::RecordTruncated(offset))?;
        cur_pos += len;

        let (raw_value, text) = read_value(coding, data);

        /* Most data is just reworked with a scaler but some requires a special parsing like times */
        let (value, text) = match vif_data.vif_function {
            Some(converter) if text.is_none() => converter(vif_data.vif, data, raw_value),
            _ => (raw_value * vif_data.scaler, text),
        };

        debug!("Record at {offset}: {} = {value} {} ({text:?})", vif_data.quantity, vif_data.unit);

        records.push(DataRecord {
            value,
            unit: vif_data.unit,
            quantity: vif_data.quantity,
            function: RecordFunction::from_dif(dif),
            storage_number,
            text,
        });
    }

    return Ok(records);
}
