//! Serial port output: the kernel log and the channel the bare-metal test
//! harness reads from. `serial_print!`/`serial_println!` are only ever
//! invoked from that harness (see `lib.rs`'s panic handler and
//! `test_runner`); on a normal host `cargo test` run `_serial_print` never
//! touches the UART port or the privileged `cli`/`sti` pair, since both
//! fault outside ring 0.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

#[cfg(target_os = "none")]
use uart_16550::SerialPort;

#[cfg(target_os = "none")]
lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _serial_print(args: fmt::Arguments) {
    #[cfg(target_os = "none")]
    {
        use core::fmt::Write;

        x86_64::instructions::interrupts::without_interrupts(|| {
            SERIAL1
                .lock()
                .write_fmt(args)
                .expect("serial port write failed");
        });
    }

    #[cfg(not(target_os = "none"))]
    {
        let _ = args;
    }
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}
