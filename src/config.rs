//! Server configuration.

use crate::types::{
    RoleSet, DEFAULT_KEEP_ALIVE_SECS, ROLE_CLIENT_APP_SERVICE, ROLE_CLIENT_CUSTOMER,
    ROLE_CLIENT_NON_CUSTOMER, ROLE_PRIMARY, ROLE_SERVER_NEIGHBOR,
};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bind_addr: IpAddr,

    pub primary_port: u16,
    pub server_neighbor_port: u16,
    pub client_non_customer_port: u16,
    pub client_customer_port: u16,
    pub client_app_service_port: u16,

    /// Cap on hosted identity rows.
    pub max_hosted_identities: usize,
    /// Per-identity relationship card cap (distinct application ids).
    pub max_identity_relations: usize,
    /// Cap on follower servers.
    pub max_followers: usize,
    /// Concurrent neighborhood initializations.
    pub init_parallelism: usize,
    /// Idle sessions are closed after this many seconds without a frame.
    pub keep_alive_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "0.0.0.0".parse().unwrap(),
            primary_port: 16987,
            server_neighbor_port: 16988,
            client_non_customer_port: 16989,
            client_customer_port: 16990,
            client_app_service_port: 16991,
            max_hosted_identities: 10_000,
            max_identity_relations: 100,
            max_followers: 200,
            init_parallelism: 3,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        }
    }
}

impl Config {
    /// Listening endpoints by role, in the order they are advertised.
    pub fn role_ports(&self) -> [(RoleSet, u16); 5] {
        [
            (ROLE_PRIMARY, self.primary_port),
            (ROLE_SERVER_NEIGHBOR, self.server_neighbor_port),
            (ROLE_CLIENT_NON_CUSTOMER, self.client_non_customer_port),
            (ROLE_CLIENT_CUSTOMER, self.client_customer_port),
            (ROLE_CLIENT_APP_SERVICE, self.client_app_service_port),
        ]
    }

    fn set_role_port(&mut self, role: RoleSet, port: u16) {
        match role {
            ROLE_PRIMARY => self.primary_port = port,
            ROLE_SERVER_NEIGHBOR => self.server_neighbor_port = port,
            ROLE_CLIENT_NON_CUSTOMER => self.client_non_customer_port = port,
            ROLE_CLIENT_CUSTOMER => self.client_customer_port = port,
            ROLE_CLIENT_APP_SERVICE => self.client_app_service_port = port,
            _ => {}
        }
    }

    /// Record the port a listener actually bound (port 0 requests an
    /// ephemeral port, used by the tests).
    pub(crate) fn record_bound_port(&mut self, role: RoleSet, port: u16) {
        self.set_role_port(role, port);
    }
}
