use core::{arch::asm, fmt};

// https://wiki.osdev.org/Serial_Ports
const COM1: u16 = 0x3f8;
const DATA: u16 = COM1; // THR on write, RBR on read
const IER: u16 = COM1 + 1;
const FCR: u16 = COM1 + 2;
const LCR: u16 = COM1 + 3;
const MCR: u16 = COM1 + 4;
const LSR: u16 = COM1 + 5;

pub struct SerialWriter {
    initialized: bool,
}

pub static mut SERIAL_WRITER: SerialWriter = SerialWriter { initialized: false };

unsafe fn outb(port: u16, byte: u8) {
    asm!("out dx, al", in("dx") port, in("al") byte);
}

unsafe fn inb(port: u16) -> u8 {
    let res: u8;
    asm!("in al, dx", in("dx") port, out("al") res);
    res
}

impl SerialWriter {
    fn ensure_initialized(&mut self) {
        if self.initialized {
            return;
        }

        // SAFETY: Standard 8N1 setup at 38400 baud with FIFOs enabled.
        unsafe {
            outb(IER, 0x00);
            outb(LCR, 0x80);
            outb(DATA, 0x03);
            outb(IER, 0x00);
            outb(LCR, 0x03);
            outb(FCR, 0xC7);
            outb(MCR, 0x0F);
        }

        self.initialized = true;
    }
}

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.ensure_initialized();

        for b in s.bytes() {
            // SAFETY: Waits for the transmit buffer to drain before writing.
            unsafe {
                while inb(LSR) & 0x20 == 0 {}
                outb(DATA, b);
            }
        }

        Ok(())
    }
}
