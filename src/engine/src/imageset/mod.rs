//! Thread-safe sets of images to copy and images already copied.
//!
//! Both sets are keyed by `digest_ref + ":" + tag`: two entries with the
//! same sha256 but different repositories (or tags) are distinct, and the
//! transfer engine deduplicates the underlying blobs by digest later.

mod processed;
mod unprocessed;

pub use processed::{ProcessedImage, ProcessedImages};
pub use unprocessed::{UnprocessedImageRef, UnprocessedImageRefs};
