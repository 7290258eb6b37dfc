use crate::api::ReplicationOptionsValidated;

#[derive(Clone, Debug)]
pub(crate) struct PrimaryEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Everything the workers need to know about who they are and where they connect.
#[derive(Clone, Debug)]
pub(crate) struct ReplicaSettings {
    pub server_id: u32,
    pub primary: PrimaryEndpoint,
    /// Host and port to register with the primary. No registration when `None`.
    pub report: Option<(String, u16)>,
    pub options: ReplicationOptionsValidated,
}
