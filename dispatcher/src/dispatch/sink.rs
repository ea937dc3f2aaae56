//! Result sinks: how outcomes travel back to the transport.

use tokio::sync::{mpsc, oneshot};

use super::request::{Outcome, RequestId};

/// One resolved request.
#[derive(Debug)]
pub struct Delivery {
    pub request_id: RequestId,
    pub outcome: Outcome,
}

/// Single-use handle that receives exactly one `Delivery`.
///
/// `OneShot` serves request/response callers that wait on a receiver.
/// `Stream` serves persistent sessions; many requests share one channel and
/// results are appended as they resolve. The stream is unbounded so delivery
/// never blocks the dispatcher; the number of undelivered results per session
/// is bounded by queue capacity plus worker count.
#[derive(Debug)]
pub enum ResultSink {
    OneShot(oneshot::Sender<Delivery>),
    Stream(mpsc::UnboundedSender<Delivery>),
}

impl ResultSink {
    /// Create a one-shot sink and the receiver its caller waits on.
    pub fn oneshot() -> (Self, oneshot::Receiver<Delivery>) {
        let (tx, rx) = oneshot::channel();
        (ResultSink::OneShot(tx), rx)
    }

    /// Create a streaming channel; clone the sink per submitted request.
    pub fn stream() -> (mpsc::UnboundedSender<Delivery>, mpsc::UnboundedReceiver<Delivery>) {
        mpsc::unbounded_channel()
    }

    /// Send the delivery. Returns false if the receiving side is gone.
    pub(crate) fn deliver(self, delivery: Delivery) -> bool {
        match self {
            ResultSink::OneShot(tx) => tx.send(delivery).is_ok(),
            ResultSink::Stream(tx) => tx.send(delivery).is_ok(),
        }
    }
}
