use std::marker::PhantomData;
use tracing::warn;

/// Transmitter for sending items over an underlying channel.
pub trait Tx
where
    Self: Clone + Send,
{
    type Item;
    type Error;
    fn send(&self, item: Self::Item) -> Result<(), Self::Error>;
}

/// [`Tx`] backed by an unbounded tokio mpsc sender, with the error type erased into `Error`.
#[derive(Debug)]
pub struct UnboundedTx<T, Error> {
    pub tx: tokio::sync::mpsc::UnboundedSender<T>,
    phantom: PhantomData<Error>,
}

impl<T, Error> Clone for UnboundedTx<T, Error> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            phantom: PhantomData,
        }
    }
}

impl<T, Error> UnboundedTx<T, Error> {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<T>) -> Self {
        Self {
            tx,
            phantom: PhantomData,
        }
    }
}

impl<T, Error> Tx for UnboundedTx<T, Error>
where
    T: Send,
    Error: From<tokio::sync::mpsc::error::SendError<T>> + Send,
{
    type Item = T;
    type Error = Error;

    fn send(&self, item: Self::Item) -> Result<(), Self::Error> {
        self.tx.send(item).map_err(Error::from)
    }
}

/// Receiver half of [`mpsc_unbounded`].
#[derive(Debug)]
pub struct UnboundedRx<T> {
    pub rx: tokio::sync::mpsc::UnboundedReceiver<T>,
}

impl<T> UnboundedRx<T> {
    pub fn new(rx: tokio::sync::mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> tokio_stream::wrappers::UnboundedReceiverStream<T> {
        tokio_stream::wrappers::UnboundedReceiverStream::new(self.rx)
    }
}

/// Construct an unbounded channel wrapped in the typed [`UnboundedTx`] / [`UnboundedRx`] halves.
pub fn mpsc_unbounded<T, Error>() -> (UnboundedTx<T, Error>, UnboundedRx<T>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (UnboundedTx::new(tx), UnboundedRx::new(rx))
}

/// Transmitter that disables itself the first time its receiver is found dropped.
///
/// Used for observability streams where a departed consumer must not take the producer down.
#[derive(Debug, Clone)]
pub struct ChannelTxDroppable<ChannelTx> {
    pub state: ChannelState<ChannelTx>,
}

impl<ChannelTx> ChannelTxDroppable<ChannelTx> {
    pub fn new(tx: ChannelTx) -> Self {
        Self {
            state: ChannelState::Active(tx),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChannelState<Tx> {
    Active(Tx),
    Disabled,
}

impl<ChannelTx> ChannelTxDroppable<ChannelTx>
where
    ChannelTx: Tx,
{
    pub fn send(&mut self, item: ChannelTx::Item) {
        let ChannelState::Active(tx) = &self.state else {
            return;
        };

        if tx.send(item).is_err() {
            let name = std::any::type_name::<ChannelTx::Item>();
            warn!(
                name,
                "ChannelTxDroppable receiver dropped - items will no longer be sent"
            );
            self.state = ChannelState::Disabled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RxDropped;

    #[test]
    fn unbounded_tx_send_and_receive() {
        let (tx, mut rx) = mpsc_unbounded::<u64, RxDropped>();
        tx.send(42).unwrap();
        assert_eq!(rx.rx.try_recv().unwrap(), 42);
    }

    #[test]
    fn unbounded_tx_errors_after_rx_drop() {
        let (tx, rx) = mpsc_unbounded::<u64, RxDropped>();
        drop(rx);
        assert_eq!(tx.send(1), Err(RxDropped));
    }

    #[test]
    fn droppable_tx_disables_after_rx_drop() {
        let (tx, rx) = mpsc_unbounded::<u64, RxDropped>();
        let mut droppable = ChannelTxDroppable::new(tx);
        drop(rx);

        droppable.send(1);
        assert!(matches!(droppable.state, ChannelState::Disabled));

        // Further sends are silent no-ops
        droppable.send(2);
    }
}
