//! Hardware constants for supported boards.
//!
//! Each board module defines pin assignments and capabilities
//! selected at compile time via feature flags.

#[cfg(feature = "xiao")]
mod hw {
    pub const HAS_PSRAM: bool = true;
    pub const HAS_SD_SLOT: bool = false;
    pub const BOARD_NAME: &str = "xiao_esp32s3";
    /// Button pulled low when pressed.
    pub const BUTTON_PIN: u8 = 0;
    /// Heap region handed to esp-alloc.
    pub const HEAP_SIZE: usize = 192 * 1024;
}

#[cfg(feature = "m5stickc")]
mod hw {
    pub const HAS_PSRAM: bool = false;
    pub const HAS_SD_SLOT: bool = false;
    pub const BOARD_NAME: &str = "m5stickc_plus2";
    /// Button A (front face), pulled low when pressed.
    pub const BUTTON_PIN: u8 = 37;
    /// GPIO4 must stay HIGH or the PMIC cuts power.
    pub const POWER_HOLD_PIN: u8 = 4;
    pub const HEAP_SIZE: usize = 160 * 1024;
}

#[cfg(not(any(feature = "xiao", feature = "m5stickc")))]
mod hw {
    pub const HAS_PSRAM: bool = false;
    pub const HAS_SD_SLOT: bool = false;
    pub const BOARD_NAME: &str = "unknown";
    pub const BUTTON_PIN: u8 = 0;
    pub const HEAP_SIZE: usize = 128 * 1024;
}

pub use hw::*;
