//! Parameter-set and slice-header records, parsed from RBSP payloads handed
//! in by the NAL segmenter.

pub mod pps;
pub mod slice;
pub mod sps;

pub use pps::{Pps, PpsError};
pub use slice::{SliceHeader, SliceHeaderError, SliceType};
pub use sps::{Sps, SpsError, VuiParameters};
