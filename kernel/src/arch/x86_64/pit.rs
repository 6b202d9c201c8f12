//! PIT channel 0, mode 3 (square wave), programmed for a periodic 100 Hz
//! tick on IRQ 0.
//!
//! `ferrite_core::arch::x86_64::pit` only drives channel 2 in one-shot
//! mode for early calibration delays; this is a separate channel-0 driver
//! for the scheduler's timer interrupt, grounded on the original
//! implementation's `kernel/arch/x86_64/interrupt/timer.c`.

use ferrite_core::arch::x86_64::instructions::port::Port;

const PIT_FREQUENCY: u32 = 1_193_182;
const CHANNEL0_DATA: u16 = 0x40;
const PIT_CMD: u16 = 0x43;

/// Target tick rate.
pub const HZ: u32 = 100;

/// Reload value for a 100 Hz square wave on channel 0.
pub const RELOAD: u16 = (PIT_FREQUENCY / HZ) as u16;

/// Channel 0, access mode lobyte/hibyte, mode 3 (square wave), binary.
const CMD_CHANNEL0_MODE3: u8 = 0b0011_0110;

/// Programs channel 0 for a periodic 100 Hz interrupt on IRQ 0.
///
/// # Safety
///
/// Must be called with interrupts disabled, after the PIC has been
/// remapped and before IRQ 0 is unmasked.
pub unsafe fn init() {
    unsafe {
        Port::<u8>::new(PIT_CMD).write(CMD_CHANNEL0_MODE3);
        let data = Port::<u8>::new(CHANNEL0_DATA);
        data.write((RELOAD & 0xFF) as u8);
        data.write((RELOAD >> 8) as u8);
    }
}
