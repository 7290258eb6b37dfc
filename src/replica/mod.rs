mod applier;
mod connection;
mod errors;
mod fetcher;
mod heartbeat;
mod recovery;
mod relay_state;
mod settings;
mod shared;
#[cfg(test)]
pub(crate) mod test_utils;
mod transport;
mod wire;
mod worker;

pub use errors::ApplierError;
pub use errors::FetchError;
pub use errors::ProtocolError;
pub use recovery::ConnectionInfo;
pub use recovery::RecoveryError;
pub use recovery::RelayInfo;
pub use relay_state::UntilCondition;

pub(crate) use applier::Applier;
pub(crate) use fetcher::Fetcher;
pub(crate) use recovery::RecoveryStore;
pub(crate) use relay_state::RelayState;
pub(crate) use settings::PrimaryEndpoint;
pub(crate) use settings::ReplicaSettings;
pub(crate) use shared::SharedState;
pub(crate) use transport::PrimaryConnector;
pub(crate) use wire::TcpConnector;
pub(crate) use worker::WorkerHandle;
