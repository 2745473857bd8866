//! Console output. On bare metal everything goes to the first serial port;
//! hosted builds (unit tests) print to the test harness' stdout instead.

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        // SAFETY: Single core, and the writer is only ever used through these
        // macros.
        let writer = unsafe { &mut *core::ptr::addr_of_mut!($crate::serial::SERIAL_WRITER) };
        let _ = write!(writer, "{}", format_args!($($arg)*));
    }};
}

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {{
        $crate::print!("{}\n", format_args!($($arg)*));
    }};
}

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! eprintln {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {{
        // Red on terminals attached to the serial port.
        $crate::print!("\u{1B}[31m{}\u{1B}[0m\n", format_args!($($arg)*));
    }};
}

#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        ::std::print!($($arg)*)
    };
}

#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {
        ::std::println!($($arg)*)
    };
}

#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! eprintln {
    ($($arg:tt)*) => {
        ::std::eprintln!($($arg)*)
    };
}
