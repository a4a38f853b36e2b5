use std::sync::{Arc, Weak};
use std::time::Duration;

use canmaster_common::{
    constants::object_ids,
    messages::CanId,
    objects::Value,
    sdo::{
        abort_code, abort_request, expedited_download_request, upload_request,
        upload_segment_request, AbortCode, SdoHeader, UploadResponse, UploadSegment, ABORT,
        COMMAND_MASK, RESPONSE_DOWNLOAD, RESPONSE_SEGMENT_UPLOAD, RESPONSE_UPLOAD,
    },
    traits::AsyncCanReceiver as _,
    CanMessage, NodeId,
};
use snafu::{OptionExt as _, ResultExt as _, Snafu};

use crate::{
    bus::{BusReceiver, Topic},
    config::SdoConfig,
    network::{NetworkError, NetworkLink},
    object_dict::{DictionaryEntry, ObjectDictionary, OdError},
    request_queue::TicketQueue,
};

/// A wrapper around the AbortCode enum to allow for unknown values
///
/// Although the library should "know" all the abort codes, it is possible to receive other values
/// and this allows those to be captured and exposed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl std::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawAbortCode::Valid(abort_code) => write!(f, "{abort_code:?}"),
            RawAbortCode::Unknown(code) => write!(f, "{code:X}"),
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => Self::Valid(code),
            Err(_) => Self::Unknown(value),
        }
    }
}

/// Error returned by [`SdoClient`] methods
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SdoClientError {
    /// Timeout while awaiting an expected response, after all retries
    #[snafu(display("No SDO response"))]
    NoResponse,
    /// Received a response that could not be interpreted
    MalformedResponse,
    /// Received a ServerAbort response from the node
    #[snafu(display("Received abort accessing object 0x{index:X}sub{sub}: {abort_code}"))]
    ServerAbort {
        /// Index of the SDO access which was aborted
        index: u16,
        /// Sub index of the SDO access which was aborted
        sub: u8,
        /// Reason for the abort
        abort_code: RawAbortCode,
    },
    /// Received a segment with the wrong toggle bit
    ToggleNotAlternated,
    /// An SDO upload response had a size that did not match the expected size
    UnexpectedSize,
    /// Failed to write a message to the socket
    #[snafu(display("Failed to send CAN message: {message}"))]
    SocketSendFailed {
        /// A string describing the error reason
        message: String,
    },
    /// The transfer would require a segmented download
    #[snafu(display("Unsupported transfer: {size} byte download requires a segmented transfer"))]
    UnsupportedTransfer {
        /// The number of bytes to be written
        size: usize,
    },
    /// The dictionary entry has no SDO client to perform I/O with
    #[snafu(display("Object 0x{index:04X}sub{sub} is not bound to an SDO client"))]
    NotBound {
        /// The object index
        index: u16,
        /// The object sub index
        sub: u8,
    },
    /// Dictionary lookup or value conversion failed
    #[snafu(display("{source}"))]
    Dictionary {
        /// The dictionary error
        source: OdError,
    },
    /// The client is not associated with a network, or the network has been dropped
    Detached,
}

type Result<T> = std::result::Result<T, SdoClientError>;

use paste::paste;
macro_rules! access_methods {
    ($type: ty) => {

        paste! {
            #[doc = concat!("Read a ", stringify!($type), " sub object from the SDO server\n\n")]
            #[doc = concat!("This is an alias for upload_", stringify!($type), " for a more intuitive API")]
            pub async fn [<read_ $type>](&self, index: u16, sub: u8) -> Result<$type> {
                self.[<upload_ $type>](index, sub).await
            }

            #[doc = concat!("Read a ", stringify!($type), " sub object from the SDO server")]
            pub async fn [<upload_ $type>](&self, index: u16, sub: u8) -> Result<$type> {
                let data = self.upload(index, sub).await?;
                let bytes: [u8; core::mem::size_of::<$type>()] = data
                    .try_into()
                    .map_err(|_| UnexpectedSizeSnafu.build())?;
                Ok($type::from_le_bytes(bytes))
            }

            #[doc = concat!("Write a ", stringify!($type), " sub object on the SDO server\n\n")]
            #[doc = concat!("This is an alias for download_", stringify!($type), " for a more intuitive API")]
            pub async fn [<write_ $type>](&self, index: u16, sub: u8, value: $type) -> Result<()> {
                self.[<download_ $type>](index, sub, value).await
            }

            #[doc = concat!("Write a ", stringify!($type), " sub object on the SDO server")]
            pub async fn [<download_ $type>](&self, index: u16, sub: u8, value: $type) -> Result<()> {
                let data = value.to_le_bytes();
                self.download(index, sub, &data).await
            }
        }
    };
}

/// The identity object (0x1018) of a device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Vendor ID
    pub vendor_id: u32,
    /// Product code
    pub product_code: u32,
    /// Revision number
    pub revision: u32,
    /// Serial number
    pub serial: u32,
}

/// A client for accessing a node's default SDO server
///
/// Transactions from any number of tasks are served one at a time, in the order they were
/// started. Each request is retried with exponential backoff when no response arrives.
pub struct SdoClient {
    node_id: NodeId,
    od: Arc<ObjectDictionary>,
    link: NetworkLink,
    queue: TicketQueue,
    config: SdoConfig,
    this: Weak<SdoClient>,
}

impl core::fmt::Debug for SdoClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdoClient")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

/// Response families an exchange can wait for
#[derive(Clone, Copy, Debug)]
enum Expect {
    Upload,
    Segment,
    Download,
}

impl Expect {
    fn command(&self) -> u8 {
        match self {
            Expect::Upload => RESPONSE_UPLOAD,
            Expect::Segment => RESPONSE_SEGMENT_UPLOAD,
            Expect::Download => RESPONSE_DOWNLOAD,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Expect::Upload => "ConfirmUpload",
            Expect::Segment => "UploadSegment",
            Expect::Download => "ConfirmDownload",
        }
    }

    /// Does a frame on the response COB-ID answer a request for index/sub?
    fn matches(&self, msg: &CanMessage, index: u16, sub: u8) -> bool {
        let Some(&command) = msg.data().first() else {
            return false;
        };
        let specifier = command & COMMAND_MASK;
        if specifier == ABORT {
            return SdoHeader::parse(msg.data()).is_some_and(|h| h.is_for(index, sub));
        }
        if specifier != self.command() {
            return false;
        }
        match self {
            // Segments do not echo the object
            Expect::Segment => true,
            Expect::Upload | Expect::Download => {
                SdoHeader::parse(msg.data()).is_some_and(|h| h.is_for(index, sub))
            }
        }
    }
}

/// Fail with ServerAbort if the frame is an abort
fn check_abort(msg: &CanMessage, index: u16, sub: u8) -> Result<()> {
    let data = msg.data();
    if data.first().map(|c| c & COMMAND_MASK) == Some(ABORT) {
        let code = abort_code(data).context(MalformedResponseSnafu)?;
        return ServerAbortSnafu {
            index,
            sub,
            abort_code: RawAbortCode::from(code),
        }
        .fail();
    }
    Ok(())
}

impl SdoClient {
    pub(crate) fn new(
        node_id: NodeId,
        od: Arc<ObjectDictionary>,
        link: NetworkLink,
        config: SdoConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            node_id,
            od,
            link,
            queue: TicketQueue::new(),
            config,
            this: this.clone(),
        })
    }

    /// The ID of the node this client talks to
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The timing configuration
    pub fn config(&self) -> &SdoConfig {
        &self.config
    }

    fn req_cob_id(&self) -> CanId {
        self.node_id.sdo_request_id()
    }

    fn resp_cob_id(&self) -> CanId {
        self.node_id.sdo_response_id()
    }

    async fn send_once(&self, data: [u8; 8]) -> Result<()> {
        let network = self.link.get().context(DetachedSnafu)?;
        network
            .send_message(self.req_cob_id(), &data)
            .await
            .map_err(|e| {
                let message = match e {
                    NetworkError::SendFailed { message } => message,
                    other => other.to_string(),
                };
                SocketSendFailedSnafu { message }.build()
            })
    }

    async fn wait_for_response(
        &self,
        rx: &mut BusReceiver,
        expect: Expect,
        index: u16,
        sub: u8,
    ) -> Option<CanMessage> {
        let wait_until = tokio::time::Instant::now() + self.config.response_timeout();
        loop {
            match tokio::time::timeout_at(wait_until, rx.recv()).await {
                // Err indicates the timeout elapsed, so return
                Err(_) => return None,
                Ok(Ok(msg)) => {
                    if expect.matches(&msg, index, sub) {
                        return Some(msg);
                    }
                    log::debug!(
                        "Node {}: ignoring SDO frame {:02X?} while waiting for {}",
                        self.node_id,
                        msg.data(),
                        expect.name()
                    );
                }
                Ok(Err(_)) => return None,
            }
        }
    }

    /// Send a request and wait for the matching response, retrying on timeout or send failure
    async fn exchange(
        &self,
        request: [u8; 8],
        expect: Expect,
        index: u16,
        sub: u8,
    ) -> Result<CanMessage> {
        let mut backoff = self.config.min_backoff();
        let mut send_error = None;
        let mut sent = false;

        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                log::debug!(
                    "Node {}: retrying SDO request for 0x{index:04X}sub{sub} in {backoff:?} ({attempt}/{})",
                    self.node_id,
                    self.config.retries
                );
                tokio::time::sleep(backoff).await;
                backoff *= self.config.backoff_factor;
            }

            let network = self.link.get().context(DetachedSnafu)?;
            // Subscribe before sending, so a fast response cannot be missed
            let mut rx = network.bus().subscribe_channel(Topic::Id(self.resp_cob_id().raw()));
            drop(network);

            if let Err(e) = self.send_once(request).await {
                if e == SdoClientError::Detached {
                    return Err(e);
                }
                log::debug!("Node {}: SDO send failed: {e}", self.node_id);
                send_error = Some(e);
                continue;
            }
            sent = true;

            if let Some(msg) = self.wait_for_response(&mut rx, expect, index, sub).await {
                return Ok(msg);
            }
        }

        match send_error {
            Some(e) if !sent => Err(e),
            _ => NoResponseSnafu.fail(),
        }
    }

    /// Write data to a sub-object on the SDO server
    ///
    /// Only expedited transfers are supported, so data must be 1 to 4 bytes long.
    pub async fn download(&self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        let request = expedited_download_request(index, sub, data)
            .context(UnsupportedTransferSnafu { size: data.len() })?;

        let ticket = self.queue.acquire().await;
        log::debug!(
            "Node {}: download 0x{index:04X}sub{sub} (ticket {})",
            self.node_id,
            ticket.number()
        );

        let resp = self.exchange(request, Expect::Download, index, sub).await?;
        check_abort(&resp, index, sub)
    }

    /// Read a sub-object on the SDO server
    pub async fn upload(&self, index: u16, sub: u8) -> Result<Vec<u8>> {
        let ticket = self.queue.acquire().await;
        log::debug!(
            "Node {}: upload 0x{index:04X}sub{sub} (ticket {})",
            self.node_id,
            ticket.number()
        );

        let resp = self
            .exchange(upload_request(index, sub), Expect::Upload, index, sub)
            .await?;
        check_abort(&resp, index, sub)?;

        match UploadResponse::parse(resp.data()).context(MalformedResponseSnafu)? {
            UploadResponse::Expedited(data) => Ok(data),
            UploadResponse::Segmented { size } => self.upload_segments(index, sub, size).await,
        }
    }

    async fn upload_segments(&self, index: u16, sub: u8, size: Option<u32>) -> Result<Vec<u8>> {
        let mut read_buf = Vec::new();
        let mut toggle = false;
        loop {
            let resp = self
                .exchange(upload_segment_request(toggle), Expect::Segment, index, sub)
                .await?;
            check_abort(&resp, index, sub)?;

            let segment = UploadSegment::parse(resp.data()).context(MalformedResponseSnafu)?;
            if segment.toggle != toggle {
                self.abort_quietly(index, sub, AbortCode::ToggleNotAlternated)
                    .await;
                return ToggleNotAlternatedSnafu.fail();
            }
            read_buf.extend_from_slice(&segment.data);
            if size.is_some_and(|size| read_buf.len() > size as usize) {
                self.abort_quietly(index, sub, AbortCode::DataTypeMismatchLengthHigh)
                    .await;
                return UnexpectedSizeSnafu.fail();
            }
            if segment.last {
                break;
            }
            toggle = !toggle;
        }

        if let Some(size) = size {
            if read_buf.len() != size as usize {
                return UnexpectedSizeSnafu.fail();
            }
        }
        Ok(read_buf)
    }

    /// Abort a transfer, logging rather than returning a send failure
    async fn abort_quietly(&self, index: u16, sub: u8, code: AbortCode) {
        if let Err(e) = self.send_once(abort_request(index, sub, code)).await {
            log::warn!("Node {}: failed to send SDO abort: {e}", self.node_id);
        }
    }

    /// Read an object and decode it using its dictionary type
    ///
    /// The value is also cached in the dictionary.
    pub async fn read(&self, index: u16, sub: u8) -> Result<Value> {
        let var = self.od.variable(index, sub).context(DictionarySnafu)?;
        var.bind_sdo_weak(self.this.clone());
        var.read().await
    }

    /// Encode a value using its dictionary type and write it to the object
    pub async fn write(&self, index: u16, sub: u8, value: impl Into<Value>) -> Result<()> {
        let var = self.od.variable(index, sub).context(DictionarySnafu)?;
        var.bind_sdo_weak(self.this.clone());
        var.write(value).await
    }

    /// Get a dictionary entry by name, bound to this client
    pub fn get(&self, name: &str) -> Result<DictionaryEntry> {
        let entry = self.od.find_by_name(name).context(DictionarySnafu)?.clone();
        entry.bind_sdo_weak(&self.this);
        Ok(entry)
    }

    access_methods!(f64);
    access_methods!(f32);
    access_methods!(u64);
    access_methods!(u32);
    access_methods!(u16);
    access_methods!(u8);
    access_methods!(i64);
    access_methods!(i32);
    access_methods!(i16);
    access_methods!(i8);

    /// Read a string from the SDO server
    ///
    /// It will be read and assumed to contain valid UTF8 characters
    pub async fn read_visible_string(&self, index: u16, sub: u8) -> Result<String> {
        let bytes = self.upload(index, sub).await?;
        Ok(String::from_utf8_lossy(&bytes).into())
    }

    /// Read the identity object
    ///
    /// All nodes should implement this object
    pub async fn read_identity(&self) -> Result<Identity> {
        let vendor_id = self.upload_u32(object_ids::IDENTITY, 1).await?;
        let product_code = self.upload_u32(object_ids::IDENTITY, 2).await?;
        let revision = self.upload_u32(object_ids::IDENTITY, 3).await?;
        let serial = self.upload_u32(object_ids::IDENTITY, 4).await?;
        Ok(Identity {
            vendor_id,
            product_code,
            revision,
            serial,
        })
    }

    /// Read the device name object
    pub async fn read_device_name(&self) -> Result<String> {
        self.read_visible_string(object_ids::DEVICE_NAME, 0).await
    }

    /// Read the software version object
    pub async fn read_software_version(&self) -> Result<String> {
        self.read_visible_string(object_ids::SOFTWARE_VERSION, 0)
            .await
    }

    /// Read the hardware version object
    pub async fn read_hardware_version(&self) -> Result<String> {
        self.read_visible_string(object_ids::HARDWARE_VERSION, 0)
            .await
    }

    /// Time from the first attempt of a request until it gives up with no response
    pub fn give_up_after(&self) -> Duration {
        let mut total = self.config.response_timeout();
        let mut backoff = self.config.min_backoff();
        for _ in 0..self.config.retries {
            total += backoff + self.config.response_timeout();
            backoff *= self.config.backoff_factor;
        }
        total
    }
}
