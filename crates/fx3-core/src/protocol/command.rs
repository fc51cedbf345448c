//! Vendor request codes understood by the streaming firmware.

use std::fmt;

/// Vendor commands (bRequest values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Fx3Command {
    /// Start the GPIF engine and stream ADC data. WRITE: u32
    StartFx3 = 0xAA,
    /// Stop the GPIF engine. WRITE: u32
    StopFx3 = 0xAB,
    /// Device information (model, version). READ: u32
    TestFx3 = 0xAC,
    /// Drive the GPIO lines. WRITE: u32 mask
    GpioFx3 = 0xAD,
    /// I2C write. VALUE: i2c address, INDEX: register
    I2cWriteFx3 = 0xAE,
    /// I2C read. VALUE: i2c address, INDEX: register
    I2cReadFx3 = 0xAF,
    /// Reset the USB controller back into the ROM bootloader.
    ResetFx3 = 0xB1,
    /// Start the ADC clock. WRITE: u32 frequency
    StartAdc = 0xB2,
    /// Initialize the R82xx tuner.
    TunerInit = 0xB4,
    /// Tune the R82xx tuner. WRITE: u64 frequency
    TunerTune = 0xB5,
    /// Set an argument. VALUE: argument value, INDEX: argument id
    SetArgFx3 = 0xB6,
    /// Put the tuner in standby.
    TunerStandby = 0xB8,
    /// Read the firmware debug string.
    ReadInfoDebug = 0xBA,
}

impl Fx3Command {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Fx3Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Fx3Command::StartFx3 => "STARTFX3",
            Fx3Command::StopFx3 => "STOPFX3",
            Fx3Command::TestFx3 => "TESTFX3",
            Fx3Command::GpioFx3 => "GPIOFX3",
            Fx3Command::I2cWriteFx3 => "I2CWFX3",
            Fx3Command::I2cReadFx3 => "I2CRFX3",
            Fx3Command::ResetFx3 => "RESETFX3",
            Fx3Command::StartAdc => "STARTADC",
            Fx3Command::TunerInit => "TUNERINIT",
            Fx3Command::TunerTune => "TUNERTUNE",
            Fx3Command::SetArgFx3 => "SETARGFX3",
            Fx3Command::TunerStandby => "TUNERSTDBY",
            Fx3Command::ReadInfoDebug => "READINFODEBUG",
        };
        write!(f, "{name} (0x{:02X})", self.code())
    }
}

/// Argument ids carried in the index field of `SETARGFX3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Argument {
    /// R82xx LNA/mixer gain, 0-29
    R82xxAttenuator = 1,
    /// R82xx VGA gain, 0-15
    R82xxVga = 2,
    /// R82xx sideband, 0/1
    R82xxSideband = 3,
    /// R82xx harmonic, 0/1
    R82xxHarmonic = 4,
    /// DAT-31 attenuator, 0-63
    Dat31Attenuator = 10,
    /// AD8340 VGA, 0-255
    Ad8340Vga = 11,
    /// Preselector, 0-2
    Preselector = 12,
    /// VHF attenuator, 0-15
    VhfAttenuator = 13,
}

impl Argument {
    pub const fn id(self) -> u16 {
        self as u16
    }
}

/// GPIO lines driven by `GPIOFX3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GpioPin {
    AttLe = 1 << 0,
    AttClk = 1 << 1,
    AttData = 1 << 2,
    Sel0 = 1 << 3,
    Sel1 = 1 << 4,
    Shutdown = 1 << 5,
    Dither = 1 << 6,
    Randomize = 1 << 7,
    BiasHf = 1 << 8,
    BiasVhf = 1 << 9,
    LedYellow = 1 << 10,
    LedRed = 1 << 11,
    LedBlue = 1 << 12,
    AttSel0 = 1 << 13,
    AttSel1 = 1 << 14,
    // RX888r2
    VhfEnable = 1 << 15,
    PgaEnable = 1 << 16,
}

impl GpioPin {
    pub const fn mask(self) -> u32 {
        self as u32
    }
}

/// OR together the masks of `pins`.
pub fn gpio_mask(pins: &[GpioPin]) -> u32 {
    pins.iter().fold(0, |acc, pin| acc | pin.mask())
}
