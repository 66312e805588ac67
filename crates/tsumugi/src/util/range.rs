#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    pub fn to_http_range(&self) -> String {
        if let Some(length) = self.length {
            // an empty range would underflow, parsers reject it anyway
            format!("bytes={}-{}", self.offset, self.offset + length.max(1) - 1)
        } else {
            format!("bytes={}-", self.offset)
        }
    }
}
