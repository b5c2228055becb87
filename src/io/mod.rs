mod source;

pub use source::{FileImageSource, ImageSource, MemoryImageSource, HEADER_PROBE_LEN};
