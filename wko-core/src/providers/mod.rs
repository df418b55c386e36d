//! Injectable providers for time and filesystem access.
//!
//! Production code receives [`SystemClock`] and [`RealFs`]; tests pass
//! [`MockClock`] and [`MemoryFs`] through the same constructors instead of
//! patching globals.

mod clock;
mod fs;

pub use clock::{Clock, MockClock, SystemClock};
pub use fs::{FileSystem, MemoryFs, RealFs};
