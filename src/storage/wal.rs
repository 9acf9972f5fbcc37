//! Write-ahead log.
//!
//! A bounded circular log of whole-block images. Appends are grouped and made
//! durable by a background logger; a background installer later copies them to
//! their home blocks and frees log space.

mod daemon;
pub mod manager;
pub mod record;

pub use manager::{Daemon, LogPositions, WalConfig, Walog};
pub use record::{BlockData, LogPosition, HDRADDRS, LOGHDR, LOGHDR2, LOGSTART};
