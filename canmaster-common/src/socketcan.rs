//! Linux socketcan transport

use std::sync::Arc;

use crate::{
    messages::{CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender},
};
use snafu::Snafu;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, ShouldRetry, Socket};
use tokio::io::{unix::AsyncFd, Interest};

fn to_socketcan_id(id: CanId) -> Option<socketcan::CanId> {
    match id {
        CanId::Extended(id) => socketcan::ExtendedId::new(id).map(Into::into),
        CanId::Std(id) => socketcan::StandardId::new(id).map(Into::into),
    }
}

/// Convert a received frame. Error frames are logged and dropped.
fn from_socketcan_frame(frame: CanFrame) -> Option<CanMessage> {
    let id = match frame.can_id() {
        socketcan::CanId::Standard(id) => CanId::std(id.as_raw()),
        socketcan::CanId::Extended(id) => CanId::extended(id.as_raw()),
    };

    match frame {
        CanFrame::Data(frame) => Some(CanMessage::new(id, frame.data())),
        CanFrame::Remote(_) => Some(CanMessage::new_rtr(id)),
        CanFrame::Error(frame) => {
            log::warn!("Received CAN error frame 0x{:X}", frame.error_bits());
            None
        }
    }
}

fn to_socketcan_frame(msg: &CanMessage) -> Option<CanFrame> {
    let id = to_socketcan_id(msg.id())?;
    if msg.is_rtr() {
        CanFrame::new_remote(id, 0)
    } else {
        CanFrame::new(id, msg.data())
    }
}

/// Errors from reading the CAN socket
#[derive(Debug, Snafu)]
pub enum ReceiveError {
    /// The socket failed
    Io {
        /// The underlying error
        source: socketcan::IoError,
    },
}

/// An async wrapper around a non-blocking socketcan socket
#[derive(Debug)]
struct AsyncCanSocket(AsyncFd<CanSocket>);

impl AsyncCanSocket {
    fn open(ifname: &str) -> Result<Self, std::io::Error> {
        let socket = CanSocket::open(ifname)?;
        socket.set_nonblocking(true)?;
        Ok(Self(AsyncFd::new(socket)?))
    }

    fn try_read_frame(&self) -> Result<CanFrame, std::io::Error> {
        self.0.get_ref().read_frame()
    }

    async fn read_frame(&self) -> Result<CanFrame, std::io::Error> {
        self.0
            .async_io(Interest::READABLE, |inner| inner.read_frame())
            .await
    }

    async fn write_frame(&self, frame: &CanFrame) -> Result<(), std::io::Error> {
        self.0
            .async_io(Interest::WRITABLE, |inner| inner.write_frame(frame))
            .await
    }
}

/// Receiving half of a socketcan transport
#[derive(Debug, Clone)]
pub struct SocketCanReceiver {
    socket: Arc<AsyncCanSocket>,
}

impl AsyncCanReceiver for SocketCanReceiver {
    type Error = ReceiveError;

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.socket
            .try_read_frame()
            .ok()
            .and_then(from_socketcan_frame)
    }

    async fn recv(&mut self) -> Result<CanMessage, ReceiveError> {
        loop {
            match self.socket.read_frame().await {
                Ok(frame) => {
                    if let Some(msg) = from_socketcan_frame(frame) {
                        return Ok(msg);
                    }
                }
                Err(e) => {
                    if !e.should_retry() {
                        return Err(ReceiveError::Io { source: e });
                    }
                }
            }
        }
    }
}

/// Sending half of a socketcan transport
#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<AsyncCanSocket>,
}

impl AsyncCanSender for SocketCanSender {
    type Error = CanMessage;

    async fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        let Some(frame) = to_socketcan_frame(&msg) else {
            return Err(msg);
        };
        self.socket.write_frame(&frame).await.map_err(|e| {
            log::warn!("socketcan write on {} failed: {e}", msg.id());
            msg
        })
    }
}

/// Open a socketcan device and split it into a sender and receiver
///
/// # Arguments
/// * `device` - The name of the socketcan device to open, e.g. "vcan0", or "can0"
///
/// Both halves share one socket, so the receiver does not see frames sent by the sender.
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
) -> Result<(SocketCanSender, SocketCanReceiver), socketcan::IoError> {
    let socket = Arc::new(AsyncCanSocket::open(device.as_ref())?);
    let receiver = SocketCanReceiver {
        socket: socket.clone(),
    };
    let sender = SocketCanSender { socket };
    Ok((sender, receiver))
}
