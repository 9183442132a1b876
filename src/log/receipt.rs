use tokio::sync::watch;

use super::{LogError, LogResult};
use crate::message::Offset;

type ReceiptState = Option<LogResult<Offset>>;

/// Creates the two halves of a write receipt: the log keeps the writer and
/// resolves it once, the appender waits on the receipt.
pub fn write_receipt() -> (ReceiptWriter, WriteReceipt) {
    let (tx, rx) = watch::channel(None);
    (ReceiptWriter { tx }, WriteReceipt { rx })
}

/// Resolving side of a receipt. Resolution consumes the writer, so a receipt
/// can only ever be resolved once.
#[derive(Debug)]
pub struct ReceiptWriter {
    tx: watch::Sender<ReceiptState>,
}

impl ReceiptWriter {
    pub fn succeed(self, offset: Offset) {
        self.resolve(Ok(offset));
    }

    pub fn fail(self, err: LogError) {
        self.resolve(Err(err));
    }

    fn resolve(self, result: LogResult<Offset>) {
        self.tx.send_replace(Some(result));
    }
}

/// Future-like handle over the offset of an appended message.
#[derive(Debug, Clone)]
pub struct WriteReceipt {
    rx: watch::Receiver<ReceiptState>,
}

impl WriteReceipt {
    /// Waits until the receipt is resolved. Also returns if the writer was
    /// dropped without resolving, in which case `read` keeps failing with
    /// `ReceiptNotWritten`.
    pub async fn done(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(Option::is_some).await;
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Non-blocking read of the resolution.
    pub fn read(&self) -> LogResult<Offset> {
        match &*self.rx.borrow() {
            Some(result) => result.clone(),
            None => Err(LogError::ReceiptNotWritten),
        }
    }
}
