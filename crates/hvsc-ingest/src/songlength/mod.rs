//! Songlength (duration metadata) resolution
//!
//! HVSC ships song durations redundantly: `Songlengths.md5` keyed by content
//! hash (with `; /path` comments) and the older path-keyed
//! `Songlengths.txt`. The [`SonglengthFacade`] discovers both inside the
//! library, merges them with the hash-keyed file taking priority and
//! answers queries by virtual path, file name or content hash.

mod facade;
mod parser;

pub use facade::{
    SONGLENGTH_LOCATIONS, SonglengthFacade, SonglengthIndex, SonglengthQuery, SonglengthStats,
    SonglengthWarning, WarningHandler,
};
pub use parser::{
    RejectedLine, SonglengthFormat, SonglengthTable, parse_duration, parse_durations,
    parse_songlengths,
};
