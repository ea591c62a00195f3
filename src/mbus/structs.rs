use serde::Serialize;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Default)]
pub enum RecordFunction {
    #[default]
    Instantaneous,
    Maximum,
    Minimum,
    Error,
}

impl RecordFunction {
    pub fn from_dif(dif: u8) -> Self {
        return match (dif >> 4) & 0x03 {
            0 => RecordFunction::Instantaneous,
            1 => RecordFunction::Maximum,
            2 => RecordFunction::Minimum,
            _ => RecordFunction::Error,
        };
    }
}

/// One variable data record of a RSP_UD telegram, already scaled by its VIF
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct DataRecord {
    pub value: f64,
    pub unit: String,
    pub quantity: String,
    pub function: RecordFunction,
    pub storage_number: u64,
    /* Dates and ASCII records have no sensible number, the decoded text lives here */
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl DataRecord {
    pub fn new(value: f64, unit: &str) -> Self {
        return DataRecord {
            value,
            unit: unit.to_string(),
            ..Default::default()
        };
    }
}

/// The decoded answer of one device poll
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct DecodedFrame {
    pub primary_address: u8,
    pub serial_number: u32,
    pub manufacturer: String,
    pub device_type: String,
    pub version: u8,
    pub access_number: u8,
    pub status: u8,
    pub data_records: Vec<DataRecord>,
    #[serde(skip)]
    pub raw: Vec<u8>,
}
