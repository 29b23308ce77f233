pub mod rpc;

pub use rpc::NodeTransport;
