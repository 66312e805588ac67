//! Concurrent segment acquisition.
//!
//! A [`SegmentScheduler`] fetches the segments of one representation with a
//! bounded number of workers, retries failures with exponential backoff and
//! hands every payload to a single writer task which appends them to the
//! output file in index order.

mod retry;
mod scheduler;
mod session;
mod writer;

use std::future::Future;

use bytes::Bytes;
use url::Url;

pub use retry::RetryPolicy;
pub use scheduler::{SchedulerReport, SegmentScheduler};
pub use session::{DownloadSession, DownloadTask, RetrySummary, TaskState, COMPLETION_THRESHOLD};
pub use writer::{
    spawn_writer, CloseMode, SegmentWriter, WriterMessage, WriterReport, DEFAULT_REORDER_WINDOW,
};

use crate::{
    error::TsumugiResult,
    util::{http::HttpClient, range::ByteRange},
};

/// Anything segments can be fetched from.
pub trait SegmentSource: Send + Sync + 'static {
    fn fetch_bytes(
        &self,
        url: Url,
        range: Option<ByteRange>,
    ) -> impl Future<Output = TsumugiResult<Bytes>> + Send;
}

impl SegmentSource for HttpClient {
    async fn fetch_bytes(&self, url: Url, range: Option<ByteRange>) -> TsumugiResult<Bytes> {
        self.fetch(url, range.as_ref()).await
    }
}
