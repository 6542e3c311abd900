use tokio::sync::oneshot;

/// A message type that includes an acknowledgement mechanism.
/// When this is dropped or `acknowledge` is called, the sender will be notified.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    notifier: oneshot::Sender<R>,
    message: M,
}

impl<M, R> AcknowledgedMessage<M, R> {
    /// Create a new message and return it along with the AcknowledgmentReceiver that will
    /// be notified when the message is received or when it is dropped.
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                message,
                notifier: sender,
            },
            AcknowledgmentReceiver { receiver },
        )
    }

    /// Split the message from the acknowledger so that the message can be processed before
    /// acknowledgement is sent.
    pub(crate) fn into_parts(self) -> (M, Acknowledger<R>) {
        (self.message, Acknowledger(self.notifier))
    }
}

/// The sending half of an acknowledged message, detached from its payload.
#[derive(Debug)]
pub(crate) struct Acknowledger<R>(oneshot::Sender<R>);

impl<R> Acknowledger<R> {
    /// Send acknowledgement to the receiver.
    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        // returns an error when the other end hangs up e.g. due to a timeout.
        let _: std::result::Result<_, _> = self.0.send(result.into());
    }
}

/// Receiver for the acknowledgement that the message was received or dropped.
#[derive(Debug)]
pub(crate) struct AcknowledgmentReceiver<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> AcknowledgmentReceiver<R> {
    /// Wait for the message to be acknowledged. If this returns None, that means the message
    /// was dropped without the receiving end explicitly sending anything back.
    pub(crate) async fn wait_for_acknowledgment(self) -> Option<R> {
        self.receiver.await.ok()
    }
}
