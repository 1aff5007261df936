use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsccError {
    #[error("Reparse buffer is too short to contain a reparse header")]
    ReparseBufferTooShort,
    #[error("Reparse buffer name bounds are invalid")]
    InvalidNameBounds,
    #[error("Reparse tag {0:#010x} has no parseable link payload")]
    UnsupportedReparseTag(u32),
    #[error("Serialized reparse buffer would be {0} bytes, above the maximum")]
    ReparseBufferTooLarge(usize),
    #[error("Binrw Error: {0}")]
    BinRWError(#[from] binrw::Error),
}
