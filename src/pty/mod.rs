pub mod emulator;
pub mod worker;

pub use worker::PtyHandle;
