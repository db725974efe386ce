//! NS16550A UART driver, reduced to what the kernel console needs.

use core::fmt::{Result, Write};

const UART_ADDRESS: usize = 0x10000000;

const INTERRUPT_ENABLE_REGISTER: usize = 0x1;
const FIFO_CONTROL_REGISTER: usize = 0x2;
const LINE_CONTROL_REGISTER: usize = 0x3;
const LINE_STATUS_REGISTER: usize = 0x5;

const LINE_STATUS_DATA_READY: u8 = 0x1;
/// LCR value for the 8N1 line discipline.
const LCR_WORD_LENGTH_8: u8 = 0x3;

#[derive(Copy, Clone)]
/// Struct representing a NS16550A UART peripheral.
pub struct Uart {
    /// Base address of the peripheral.
    address: usize,
}

impl Uart {
    pub const fn new(address: usize) -> Self {
        Uart {
            address
        }
    }

    /// Init the UART peripheral: 8 data bits, no parity, one stop bit, FIFO
    /// and receiver interrupts enabled.
    pub fn init_default(&self) {
        let ptr = self.address as *mut u8;
        unsafe {
            ptr.add(LINE_CONTROL_REGISTER).write_volatile(LCR_WORD_LENGTH_8);
            // fcr[0] enables the FIFO.
            ptr.add(FIFO_CONTROL_REGISTER).write_volatile(1);
            // ier[0] enables receiver interrupts.
            ptr.add(INTERRUPT_ENABLE_REGISTER).write_volatile(1);
        }
    }

    /// If data ready is set, returns the value read in the receiver buffer register.
    /// Otherwise returns `None`.
    pub fn get(&self) -> Option<u8> {
        let ptr = self.address as *mut u8;
        unsafe {
            if ptr.add(LINE_STATUS_REGISTER).read_volatile() & LINE_STATUS_DATA_READY != 0 {
                Some(ptr.read_volatile())
            } else {
                None
            }
        }
    }

    pub fn put(&self, c: u8) {
        let ptr = self.address as *mut u8;
        unsafe {
            ptr.write_volatile(c);
        }
    }
}

impl Default for Uart {
    fn default() -> Self {
        Uart::new(UART_ADDRESS)
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> Result {
        s.bytes().for_each(|c| self.put(c));
        Ok(())
    }
}
