#![no_std]

//! Power-fail safe ring buffer of fixed-size records.
//!
//! On-device layout, starting at `base_address`:
//!
//! ```text
//! +---------------+---------------+---------+---------+-----+-----------------------+
//! | header slot A | header slot B | entry 0 | entry 1 | ... | entry max_entries - 1 |
//! |   32 bytes    |   32 bytes    |              entry_size bytes each            |
//! +---------------+---------------+---------+---------+-----+-----------------------+
//! ```

#[macro_use]
extern crate delog;
generate_macros!();

#[cfg(test)]
#[macro_use]
extern crate std;

mod circular;
pub mod header;

pub use circular::{CircularLogConfig, PersistentCircularLog, Recovery};
pub use header::{is_seq_newer, LogHeader, Slot};
