//! Device control channel: vendor commands for the streaming firmware.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::protocol::command::{Argument, Fx3Command, GpioPin};
use crate::protocol::constants::{ARGUMENT_TIMEOUT, DEBUG_INFO_LEN, MAX_ATTENUATION, MAX_VGA_GAIN};
use crate::transport::{ControlReadRequest, ControlRequest, ControlTransport, TransportError};

/// Send `command` with a 4-byte little-endian payload. Blocks until the device answers.
#[instrument(level = "debug", skip(transport))]
pub fn send_command<T: ControlTransport + ?Sized>(
    transport: &T,
    command: Fx3Command,
    payload: u32,
) -> Result<(), TransportError> {
    transport.control_out(ControlRequest {
        request: command.code(),
        value: 0,
        index: 0,
        data: &payload.to_le_bytes(),
        timeout: None,
    })
}

/// Set a firmware argument: value in wValue, argument id in wIndex.
pub fn send_argument<T: ControlTransport + ?Sized>(
    transport: &T,
    argument: Argument,
    value: u16,
) -> Result<(), TransportError> {
    debug!(argument = ?argument, value, "Setting argument");
    transport.control_out(ControlRequest {
        request: Fx3Command::SetArgFx3.code(),
        value,
        index: argument.id(),
        data: &[0],
        timeout: Some(ARGUMENT_TIMEOUT),
    })
}

/// Drop the running firmware and return to the ROM bootloader.
pub fn reset_to_bootloader<T: ControlTransport + ?Sized>(transport: &T) -> Result<(), TransportError> {
    send_command(transport, Fx3Command::ResetFx3, 0)
}

pub fn start_adc<T: ControlTransport + ?Sized>(transport: &T, sample_rate: u32) -> Result<(), TransportError> {
    send_command(transport, Fx3Command::StartAdc, sample_rate)
}

pub fn start_streaming<T: ControlTransport + ?Sized>(transport: &T) -> Result<(), TransportError> {
    send_command(transport, Fx3Command::StartFx3, 0)
}

pub fn stop_streaming<T: ControlTransport + ?Sized>(transport: &T) -> Result<(), TransportError> {
    send_command(transport, Fx3Command::StopFx3, 0)
}

pub fn tuner_init<T: ControlTransport + ?Sized>(transport: &T) -> Result<(), TransportError> {
    send_command(transport, Fx3Command::TunerInit, 0)
}

pub fn tuner_standby<T: ControlTransport + ?Sized>(transport: &T) -> Result<(), TransportError> {
    send_command(transport, Fx3Command::TunerStandby, 0)
}

/// Tune the R82xx to `frequency_hz` (8-byte payload).
pub fn tune<T: ControlTransport + ?Sized>(transport: &T, frequency_hz: u64) -> Result<(), TransportError> {
    transport.control_out(ControlRequest {
        request: Fx3Command::TunerTune.code(),
        value: 0,
        index: 0,
        data: &frequency_hz.to_le_bytes(),
        timeout: None,
    })
}

/// `TESTFX3`: hardware model and firmware version word.
pub fn query_self_test<T: ControlTransport + ?Sized>(transport: &T) -> Result<u32, TransportError> {
    let request = Fx3Command::TestFx3.code();
    let data = transport.control_in(ControlReadRequest {
        request,
        value: 0,
        index: 0,
        length: 4,
        timeout: None,
    })?;
    let word: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TransportError::ControlFailed {
            request,
            message: format!("short response: {} bytes", data.len()),
        })?;
    Ok(u32::from_le_bytes(word))
}

/// `READINFODEBUG`: firmware debug string, empty when the firmware has nothing to say.
pub fn read_debug_info<T: ControlTransport + ?Sized>(transport: &T) -> Result<String, TransportError> {
    let data = transport.control_in(ControlReadRequest {
        request: Fx3Command::ReadInfoDebug.code(),
        value: 0,
        index: 0,
        length: DEBUG_INFO_LEN,
        timeout: None,
    })?;
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    Ok(String::from_utf8_lossy(&data[..end]).into_owned())
}

pub fn i2c_write<T: ControlTransport + ?Sized>(
    transport: &T,
    i2c_address: u8,
    register: u16,
    data: &[u8],
) -> Result<(), TransportError> {
    transport.control_out(ControlRequest {
        request: Fx3Command::I2cWriteFx3.code(),
        value: u16::from(i2c_address),
        index: register,
        data,
        timeout: None,
    })
}

pub fn i2c_read<T: ControlTransport + ?Sized>(
    transport: &T,
    i2c_address: u8,
    register: u16,
    length: u16,
) -> Result<Vec<u8>, TransportError> {
    transport.control_in(ControlReadRequest {
        request: Fx3Command::I2cReadFx3.code(),
        value: u16::from(i2c_address),
        index: register,
        length,
        timeout: None,
    })
}

#[derive(Error, Debug)]
pub enum FrontendError {
    #[error("Attenuation {0} out of range 0-63")]
    Attenuation(u8),
    #[error("VGA gain {0} out of range 0-127")]
    VgaGain(u8),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// VGA gain mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GainMode {
    /// High gain mode
    #[default]
    High,
    /// Low gain mode
    Low,
}

/// Analog front-end settings applied before streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub dither: bool,
    pub randomize: bool,
    pub bias_hf: bool,
    pub bias_vhf: bool,
    pub pga: bool,
    /// DAT-31 attenuator, 0-63
    pub attenuation: u8,
    /// AD8340 VGA gain, 0-127; the low range is selected by `gain_mode`
    pub vga_gain: u8,
    pub gain_mode: GainMode,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            dither: false,
            randomize: false,
            bias_hf: false,
            bias_vhf: false,
            pga: false,
            attenuation: 0,
            vga_gain: 1,
            gain_mode: GainMode::High,
        }
    }
}

impl FrontendConfig {
    /// Reject settings the hardware can't take.
    pub fn validate(&self) -> Result<(), FrontendError> {
        if self.attenuation > MAX_ATTENUATION {
            return Err(FrontendError::Attenuation(self.attenuation));
        }
        if self.vga_gain > MAX_VGA_GAIN {
            return Err(FrontendError::VgaGain(self.vga_gain));
        }
        Ok(())
    }

    pub fn gpio_mask(&self) -> u32 {
        [
            (self.dither, GpioPin::Dither),
            (self.randomize, GpioPin::Randomize),
            (self.bias_hf, GpioPin::BiasHf),
            (self.bias_vhf, GpioPin::BiasVhf),
            (self.pga, GpioPin::PgaEnable),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .fold(0, |mask, (_, pin)| mask | pin.mask())
    }

    /// AD8340 register value; low gain mode sets bit 7.
    pub fn vga_value(&self) -> u16 {
        let gain = u16::from(self.vga_gain);
        match self.gain_mode {
            GainMode::High => gain,
            GainMode::Low => gain | 0x80,
        }
    }
}

/// Program GPIOs, attenuator and VGA gain. Nothing is sent if a setting is out of range.
#[instrument(level = "info", skip(transport))]
pub fn configure_frontend<T: ControlTransport + ?Sized>(
    transport: &T,
    config: &FrontendConfig,
) -> Result<(), FrontendError> {
    config.validate()?;
    send_command(transport, Fx3Command::GpioFx3, config.gpio_mask())?;
    send_argument(
        transport,
        Argument::Dat31Attenuator,
        u16::from(config.attenuation),
    )?;
    send_argument(transport, Argument::Ad8340Vga, config.vga_value())?;
    Ok(())
}
