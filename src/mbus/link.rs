use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::structs::DecodedFrame;
use super::{div_vif_parser, utils, FrameError, ReadError, TransportError};

pub const ACK: u8 = 0xE5;
const SHORT_START: u8 = 0x10;
const LONG_START: u8 = 0x68;
const STOP: u8 = 0x16;

/* Every device answers requests to this address with its own primary address */
pub const BROADCAST_REPLY: u8 = 0xFE;

const C_SND_NKE: u8 = 0x40;
const C_REQ_UD2: u8 = 0x5B;
/* Variable data respond, LSB first */
const CI_RSP_UD_VARIABLE: u8 = 0x72;
/* Identification number, manufacturer, version, medium, access number, status and signature */
const FIXED_HEADER_LEN: usize = 12;

pub fn checksum(data: &[u8]) -> u8 {
    return data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
}

fn short_frame(control: u8, address: u8) -> [u8; 5] {
    return [SHORT_START, control, address, checksum(&[control, address]), STOP];
}

/// Link reset, the device answers with a single character acknowledgement
pub fn snd_nke(address: u8) -> [u8; 5] {
    return short_frame(C_SND_NKE, address);
}

/// Request for class 2 data, the device answers with a RSP_UD long frame
pub fn req_ud2(address: u8) -> [u8; 5] {
    return short_frame(C_REQ_UD2, address);
}

/// Checks the framing of a RSP_UD long frame and decodes its fixed header and data records
pub fn decode_long_frame(raw: &[u8], expected_address: u8) -> Result<DecodedFrame, FrameError> {
    if raw.len() < 9 {
        return Err(FrameError::TooShort(raw.len()));
    }

    if raw[0] != LONG_START {
        return Err(FrameError::UnexpectedStart(raw[0]));
    }
    if raw[3] != LONG_START {
        return Err(FrameError::UnexpectedStart(raw[3]));
    }
    if raw[1] != raw[2] {
        return Err(FrameError::LengthMismatch(raw[1], raw[2]));
    }

    /* L counts C, A, CI and the user data */
    let len = raw[1] as usize;
    if len < 3 || raw.len() != len + 6 {
        return Err(FrameError::TooShort(raw.len()));
    }

    let body = &raw[4..4 + len];
    let calculated = checksum(body);
    if calculated != raw[4 + len] {
        return Err(FrameError::Checksum { calculated, received: raw[4 + len] });
    }
    if raw[5 + len] != STOP {
        return Err(FrameError::MissingStop);
    }

    let (control, address, ci) = (body[0], body[1], body[2]);
    debug!("Long frame from {address} with C field 0x{control:02x} and CI field 0x{ci:02x}");

    if expected_address != BROADCAST_REPLY && address != expected_address {
        return Err(FrameError::AddressMismatch { expected: expected_address, received: address });
    }
    if ci != CI_RSP_UD_VARIABLE {
        return Err(FrameError::UnsupportedCi(ci));
    }

    let header = body.get(3..3 + FIXED_HEADER_LEN).ok_or(FrameError::TooShort(raw.len()))?;
    let serial_number = utils::bcd_to_u64(&header[0..4]).ok_or(FrameError::InvalidIdentification)?;

    return Ok(DecodedFrame {
        primary_address: address,
        serial_number: serial_number as u32,
        manufacturer: utils::get_manufacturer(header[4], header[5]),
        version: header[6],
        device_type: utils::get_device_medium(header[7]),
        access_number: header[8],
        status: header[9],
        data_records: div_vif_parser::parse_records(&body[3 + FIXED_HEADER_LEN..])?,
        raw: raw.to_vec(),
    });
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, ReadError>
where
    F: Future<Output = Result<T, ReadError>>,
{
    return match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ReadError::Timeout(timeout)),
    };
}

/// Master side of a point to point M-Bus conversation over any byte stream
pub struct MbusLink<S> {
    stream: S,
}

impl<S> MbusLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        return MbusLink { stream };
    }

    async fn send(&mut self, telegram: &'static str, frame: &[u8]) -> Result<(), TransportError> {
        debug!("Sending {telegram}: {}", hex::encode(frame));
        self.stream.write_all(frame).await.map_err(|source| TransportError::Write { telegram, source })?;
        self.stream.flush().await.map_err(|source| TransportError::Write { telegram, source })?;
        return Ok(());
    }

    async fn read_ack(&mut self) -> Result<(), ReadError> {
        let byte = self.stream.read_u8().await?;
        if byte != ACK {
            return Err(FrameError::UnexpectedAck(byte).into());
        }
        return Ok(());
    }

    async fn read_long_frame(&mut self) -> Result<Vec<u8>, ReadError> {
        let mut raw = vec![0u8; 4];
        self.stream.read_exact(&mut raw).await?;
        if raw[0] != LONG_START {
            return Err(FrameError::UnexpectedStart(raw[0]).into());
        }

        /* L bytes of body followed by checksum and stop byte */
        let mut rest = vec![0u8; raw[1] as usize + 2];
        self.stream.read_exact(&mut rest).await?;
        raw.extend_from_slice(&rest);
        return Ok(raw);
    }

    /// Resets the device link and reads one data frame from the given primary address
    pub async fn request_frame(&mut self, address: u8, timeout: Duration) -> Result<DecodedFrame, TransportError> {
        if timeout.is_zero() {
            return Err(TransportError::Deadline(timeout));
        }

        self.send("SND_NKE", &snd_nke(address)).await?;
        with_timeout(timeout, self.read_ack()).await.map_err(TransportError::AckRead)?;

        self.send("REQ_UD2", &req_ud2(address)).await?;
        let raw = with_timeout(timeout, self.read_long_frame()).await.map_err(TransportError::FrameRead)?;
        debug!("Received from {address}: {}", hex::encode(&raw));

        return decode_long_frame(&raw, address).map_err(|e| TransportError::FrameRead(ReadError::Decode(e)));
    }
}
