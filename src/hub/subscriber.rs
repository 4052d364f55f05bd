use crate::error::DeliveryError;
use crate::events::LogRecord;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A live consumer of one stream's records
///
/// `deliver` is called from the hub's coordination loop and must not block. Any
/// error unregisters the subscriber.
#[cfg_attr(test, mockall::automock)]
pub trait Subscriber: Send {
    fn deliver(&mut self, record: &LogRecord) -> Result<(), DeliveryError>;
}

/// Subscriber backed by a bounded channel
///
/// A full buffer counts as a failed delivery, so a consumer that stops reading is
/// dropped instead of slowing down the hub.
pub struct ChannelSubscriber {
    sender: mpsc::Sender<LogRecord>,
}

impl ChannelSubscriber {
    /// Create a subscriber and the receiving end of its buffer
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<LogRecord>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&mut self, record: &LogRecord) -> Result<(), DeliveryError> {
        self.sender.try_send(record.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Lagged,
            TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }
}
