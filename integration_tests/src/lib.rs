pub mod sim_bus;
pub mod sim_device;
pub mod utils;

pub mod prelude {
    pub use super::sim_bus::{SimBus, SimBusReceiver, SimBusSender};
    pub use super::sim_device::{expedited_upload_response, SimDevice};
    pub use super::utils::{settle, start_network, BusLogger};
    pub use canmaster_client::{
        Network, NetworkConfig, Node, ObjectDictionary, RawAbortCode, Record, SdoClientError,
        Variable,
    };
    pub use canmaster_common::{sdo::AbortCode, CanId, CanMessage, DataType, NodeId, Value};
}
