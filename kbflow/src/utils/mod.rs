//! Small helpers shared by the pipeline: timestamps, fingerprints and text
//! normalisation.

pub mod hashing;
pub mod text;
pub mod timestamps;

pub use hashing::{fingerprint, hash_sorted_pairs};
pub use text::{extract_hashtags, extract_links, normalize_whitespace, slugify};
pub use timestamps::{iso_timestamp, now_utc, parse_timestamp, Timestamp, TimestampError};
