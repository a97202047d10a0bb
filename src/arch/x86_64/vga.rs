//! VGA text-mode console output.
//!
//! On the bare-metal target this writes volatile bytes straight into the
//! memory-mapped text buffer at physical address `0xb8000`. The host
//! `cargo test` build has no such physical page mapped (touching it from a
//! normal user-mode process would segfault), so that target gets a
//! different `Writer` that just forwards to the host's own stdout -- the
//! same kind of hardware/non-hardware split `net::NullSink` gives the
//! outbound network path.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(dead_code)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct ColorCode(u8);

impl ColorCode {
    fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode(((background as u8) << 4) | (foreground as u8))
    }
}

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

#[cfg(target_os = "none")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct ScreenChar {
    ascii_character: u8,
    color_code: ColorCode,
}

#[cfg(target_os = "none")]
#[repr(transparent)]
struct Buffer {
    chars: [[ScreenChar; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

#[cfg(target_os = "none")]
pub struct Writer {
    column_position: usize,
    color_code: ColorCode,
    buffer: &'static mut Buffer,
}

#[cfg(target_os = "none")]
impl Writer {
    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.column_position >= BUFFER_WIDTH {
                    self.new_line();
                }

                let row = BUFFER_HEIGHT - 1;
                let col = self.column_position;
                let color_code = self.color_code;

                // SAFETY: `buffer` points at the VGA text buffer, which
                // tolerates out-of-order volatile writes to any cell.
                unsafe {
                    core::ptr::write_volatile(
                        &mut self.buffer.chars[row][col],
                        ScreenChar { ascii_character: byte, color_code },
                    );
                }
                self.column_position += 1;
            }
        }
    }

    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                // SAFETY: both indices are in-bounds for `buffer`.
                let character = unsafe { core::ptr::read_volatile(&self.buffer.chars[row][col]) };
                unsafe { core::ptr::write_volatile(&mut self.buffer.chars[row - 1][col], character) };
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
        self.column_position = 0;
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar { ascii_character: b' ', color_code: self.color_code };
        for col in 0..BUFFER_WIDTH {
            // SAFETY: `row` and `col` are in-bounds for `buffer`.
            unsafe { core::ptr::write_volatile(&mut self.buffer.chars[row][col], blank) };
        }
    }

    fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7e | b'\n' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
    }
}

#[cfg(target_os = "none")]
impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

#[cfg(target_os = "none")]
lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        column_position: 0,
        color_code: ColorCode::new(Color::White, Color::Black),
        // SAFETY: 0xb8000 is the VGA text buffer's fixed physical address,
        // identity-mapped in kernel space by the bootloader.
        buffer: unsafe { &mut *(0xb8000 as *mut Buffer) },
    });
}

/// Host build: no VGA memory exists, so `println!`/`print!` just go to the
/// host's own stdout instead. Lets every module's inline test suite call
/// `println!` (as `mm::pagemap`'s merge-conflict log and a few others do)
/// without touching a physical address `cargo test` can't map.
#[cfg(not(target_os = "none"))]
pub struct Writer;

#[cfg(not(target_os = "none"))]
impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        std::print!("{}", s);
        Ok(())
    }
}

#[cfg(not(target_os = "none"))]
lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(|| {
            WRITER.lock().write_fmt(args).expect("VGA write_fmt failed");
        });
    }

    #[cfg(not(target_os = "none"))]
    {
        let _ = WRITER.lock().write_fmt(args);
    }
}
