//! Small helpers shared by the image-inspection crates: disk sizing and
//! human-readable byte counts.

pub mod disk;
pub mod hexdump;
pub mod util;
