use alloc::string::String;
use lazy_static::lazy_static;
use spin::Mutex;

/// The console channel of the emulated machine. On real hardware this would
/// be a UART; under the emulator it is the HTIF-style frontend stream, which
/// we model as an in-memory buffer so the embedder (or a test) can pump it
/// out.
pub struct Console {
    buf: String,
}

impl Console {
    const fn new() -> Console {
        Console { buf: String::new() }
    }

    /// Drain everything written since the last call.
    pub fn drain(&mut self) -> String {
        core::mem::take(&mut self.buf)
    }
}

impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.buf.push_str(s);
        Ok(())
    }
}

lazy_static! {
    pub static ref CONSOLE: Mutex<Console> = Mutex::new(Console::new());
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    CONSOLE.lock().write_fmt(args).expect("Printing to console failed");
}

/// Drain the console buffer (frontend pump / test inspection).
pub fn drain() -> String {
    CONSOLE.lock().drain()
}

/// Print to the machine console, `sprint`-style. The body is a block so
/// the macro works in expression position (match arms and the like).
#[macro_export]
macro_rules! sprint {
    ($($arg:tt)*) => {{
        $crate::console::_print(format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::console::_print(format_args!("[INFO] "));
        $crate::console::_print(format_args!($($arg)*));
        $crate::console::_print(format_args!("\n"));
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::console::_print(format_args!("[WARN] "));
        $crate::console::_print(format_args!($($arg)*));
        $crate::console::_print(format_args!("\n"));
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::console::_print(format_args!("[ERROR] "));
        $crate::console::_print(format_args!($($arg)*));
        $crate::console::_print(format_args!("\n"));
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn macros_work_in_expression_position() {
        super::drain();
        match 1u8 {
            1 => crate::sprint!("one"),
            _ => crate::log_warn!("unexpected"),
        }
        crate::log_info!("after");
        assert_eq!(super::drain(), "one[INFO] after\n");
    }
}
