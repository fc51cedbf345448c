//! Protocol module - FX3 wire definitions.

pub mod command;
pub mod constants;

pub use command::{Argument, Fx3Command, GpioPin, gpio_mask};
pub use constants::*;
