// Test doubles for the remote service and the tunnel backend

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dicyvpn_common::api::connect_error;
use dicyvpn_common::credentials::{AuthInfo, CredentialStore, MemoryCredentialStore};
use dicyvpn_common::types::{Ports, ProtocolPorts};
use dicyvpn_common::{
    ConnectionSession, Error, RemoteService, Result, Server, ServerList, ServerTier, TunnelStatus,
};
use tokio::sync::Notify;
use zeroize::Zeroizing;

use crate::backend::TunnelBackend;
use crate::observer::TunnelStateObserver;

/// Everything the fakes saw, in call order
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RemoteConnect(String),
    RemoteDisconnect(String),
    /// Status published at the time of the call
    BringDown(TunnelStatus),
    BringUp(String),
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub fn server(id: &str, tier: ServerTier) -> Server {
    Server {
        id: id.to_string(),
        name: format!("{} server", id),
        tier,
        country: id.split('_').next().unwrap_or("XX").to_string(),
        city: "Somewhere".to_string(),
        load: 0.5,
    }
}

pub fn primary(id: &str) -> Server {
    server(id, ServerTier::Primary)
}

pub fn secondary(id: &str) -> Server {
    server(id, ServerTier::Secondary)
}

pub fn test_credentials() -> Arc<dyn CredentialStore> {
    Arc::new(MemoryCredentialStore::with(AuthInfo {
        token: Zeroizing::new("access-token".to_string()),
        refresh_token: Zeroizing::new("refresh-token".to_string()),
        refresh_token_id: "rt-1".to_string(),
        account_id: "acc-1".to_string(),
        private_key: Zeroizing::new("yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=".to_string()),
    }))
}

/// Poll `condition` until it holds, yielding to spawned tasks in between
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Scriptable in-memory remote service
pub struct FakeRemote {
    log: EventLog,
    connect_failure: Mutex<Option<String>>,
    disconnect_fails: Mutex<bool>,
    connect_gate: Mutex<Option<Arc<Notify>>>,
    pub servers: ServerList,
    pub logins: Mutex<Vec<String>>,
    pub logouts: Mutex<usize>,
}

impl FakeRemote {
    pub fn new(log: EventLog) -> Self {
        let mut primary_servers = BTreeMap::new();
        primary_servers.insert("DE".to_string(), vec![primary("DE_01")]);
        primary_servers.insert("NL".to_string(), vec![primary("NL_02")]);
        let mut secondary_servers = BTreeMap::new();
        secondary_servers.insert("US".to_string(), vec![secondary("US_07")]);

        Self {
            log,
            connect_failure: Mutex::new(None),
            disconnect_fails: Mutex::new(false),
            connect_gate: Mutex::new(None),
            servers: ServerList {
                primary: primary_servers,
                secondary: secondary_servers,
            },
            logins: Mutex::new(Vec::new()),
            logouts: Mutex::new(0),
        }
    }

    pub fn session() -> ConnectionSession {
        ConnectionSession {
            server_ip: "203.0.113.10".to_string(),
            public_key: "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=".to_string(),
            private_key: None,
            internal_ip: "10.8.0.2".to_string(),
            ports: Ports {
                wireguard: ProtocolPorts {
                    udp: vec![51820, 53],
                    tcp: vec![],
                },
                openvpn: ProtocolPorts::default(),
            },
        }
    }

    /// Make every following connect fail with this error body
    pub fn fail_connect_with(&self, body: &str) {
        *self.connect_failure.lock().unwrap() = Some(body.to_string());
    }

    pub fn fail_disconnect(&self) {
        *self.disconnect_fails.lock().unwrap() = true;
    }

    /// Make the next connect block forever; the returned notify fires once it is in flight
    pub fn hold_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.connect_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    async fn list_servers(&self) -> Result<ServerList> {
        Ok(self.servers.clone())
    }

    async fn connect(&self, server: &Server) -> Result<ConnectionSession> {
        self.log
            .lock()
            .unwrap()
            .push(Event::RemoteConnect(server.id.clone()));

        let gate = self.connect_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notify_one();
            std::future::pending::<()>().await;
        }

        let failure = self.connect_failure.lock().unwrap().clone();
        match failure {
            Some(body) => Err(connect_error(&body)),
            None => Ok(Self::session()),
        }
    }

    async fn disconnect(&self, server: &Server) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(Event::RemoteDisconnect(server.id.clone()));

        if *self.disconnect_fails.lock().unwrap() {
            return Err(Error::Remote("disconnect refused".to_string()));
        }
        Ok(())
    }

    async fn login(&self, email: &str, _password: &str) -> Result<AuthInfo> {
        self.logins.lock().unwrap().push(email.to_string());
        Err(Error::InvalidCredentials)
    }

    async fn logout(&self) -> Result<()> {
        *self.logouts.lock().unwrap() += 1;
        Ok(())
    }
}

/// Backend that only records calls; tests report transitions by hand
pub struct FakeBackend {
    log: EventLog,
    observer: Arc<TunnelStateObserver>,
}

impl FakeBackend {
    pub fn new(log: EventLog, observer: Arc<TunnelStateObserver>) -> Self {
        Self { log, observer }
    }
}

impl TunnelBackend for FakeBackend {
    fn bring_up(&self, config: String) {
        self.log.lock().unwrap().push(Event::BringUp(config));
    }

    fn bring_down(&self) {
        let status = self.observer.status();
        self.log.lock().unwrap().push(Event::BringDown(status));
    }
}
