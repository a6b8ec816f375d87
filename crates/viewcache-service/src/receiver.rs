//! The consumer side of a [`RaceLoader`](crate::caching::RaceLoader).

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::caching::ImageRecord;

/// Receives records as soon as they become available.
///
/// A receiver is notified with the quick record first and the full one later, unless the full
/// record is ready before the quick one. Notifications for keys that are no longer the most
/// recently requested one are suppressed.
///
/// `receive` is called while the [`RaceLoader`](crate::caching::RaceLoader) holds its request
/// lock. It must return quickly and must not call back into the loader.
pub trait ReceiveImage: Send + Sync + 'static {
    fn receive(&self, record: Arc<ImageRecord>);
}

impl<F> ReceiveImage for F
where
    F: Fn(Arc<ImageRecord>) + Send + Sync + 'static,
{
    fn receive(&self, record: Arc<ImageRecord>) {
        self(record)
    }
}

impl ReceiveImage for mpsc::UnboundedSender<Arc<ImageRecord>> {
    fn receive(&self, record: Arc<ImageRecord>) {
        if self.send(record).is_err() {
            tracing::debug!("Image receiver is closed, dropping notification");
        }
    }
}
