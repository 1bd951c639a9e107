use futures::{
    channel::mpsc::{TrySendError, UnboundedSender},
    sink::Drain,
};

/// A channel that never blocks on send.
///
/// Events are sent from the mutator thread, which must not wait for consumers.
pub trait UnboundedSink<T>: Send + 'static {
    fn unbounded_send(&self, message: T) -> Result<(), T>;
}

impl<T, S: UnboundedSink<T>> UnboundedSink<T> for Option<S> {
    fn unbounded_send(&self, message: T) -> Result<(), T> {
        self.as_ref()
            .map_or(Ok(()), |sink| sink.unbounded_send(message))
    }
}

impl<T: Send + 'static> UnboundedSink<T> for UnboundedSender<T> {
    fn unbounded_send(&self, message: T) -> Result<(), T> {
        UnboundedSender::unbounded_send(self, message).map_err(TrySendError::into_inner)
    }
}

impl<T: Send + 'static> UnboundedSink<T> for Drain<T> {
    fn unbounded_send(&self, _message: T) -> Result<(), T> {
        Ok(())
    }
}
