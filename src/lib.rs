pub mod beacon;
pub mod beam;
pub mod block;
pub mod crypto;
pub mod flow_net;
pub mod logging;
pub mod packager;
pub mod publisher;
pub mod relay;
pub mod status;
