//! Transport traits
//!
//! A transport driver is split into a sender and a receiver half, so that the receiving side can
//! be pumped by one task while any number of tasks send.

use crate::messages::CanMessage;

/// An async CAN sender trait
pub trait AsyncCanSender: Send {
    /// Error type returned by sender
    type Error: CanSendError;
    /// Send a message to the bus
    fn send(
        &mut self,
        msg: CanMessage,
    ) -> impl core::future::Future<Output = Result<(), Self::Error>> + Send;
}

/// A trait for CAN errors which may come from different types of interfaces
pub trait CanSendError: core::fmt::Debug + Send {
    /// Convert the error into the undelivered message
    fn into_can_message(self) -> CanMessage;

    /// Get a string describing the error
    fn message(&self) -> String;
}

impl CanSendError for CanMessage {
    fn into_can_message(self) -> CanMessage {
        self
    }

    fn message(&self) -> String {
        format!("Failed to send message on {}", self.id())
    }
}

/// An async CAN receiver trait
pub trait AsyncCanReceiver: Send {
    /// The error type returned by recv
    type Error: core::fmt::Debug + Send;

    /// Receive available message immediately
    fn try_recv(&mut self) -> Option<CanMessage>;

    /// A blocking receive
    fn recv(
        &mut self,
    ) -> impl core::future::Future<Output = Result<CanMessage, Self::Error>> + Send;

    /// Remove any pending messages from the receiver
    fn flush(&mut self) {
        while self.try_recv().is_some() {}
    }
}
