//! Devices and their endpoints.
//!
//! A [`Device`] is what the inventory knows about one box: its identity,
//! where to reach it, how to log in, which jump host to go through and which
//! CLI dialect it speaks. Building a device creates one [`Session`] per
//! endpoint, all DISCONNECTED; the first one is the primary session.

use std::fmt;
use std::sync::Arc;

use log::warn;

use crate::protocol::{Cli, Dialect, Junos};
use crate::session::{Credentials, Session, SessionContext, Target};

/// How an endpoint reaches the device.
#[derive(Debug, Clone, Default)]
pub enum ProxyChoice {
    /// Through the device's default proxy, if it has one.
    #[default]
    Default,
    /// Straight, even when the device has a default proxy.
    Direct,
    /// Through the primary session of another device.
    Via(Arc<Device>),
}

/// One address of a device.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub address: String,
    /// Interface name or similar; the endpoint's position when absent.
    pub label: Option<String>,
    pub proxy: ProxyChoice,
}

impl EndpointSpec {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            label: None,
            proxy: ProxyChoice::Default,
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn via(mut self, proxy: Arc<Device>) -> Self {
        self.proxy = ProxyChoice::Via(proxy);
        self
    }

    pub fn direct(mut self) -> Self {
        self.proxy = ProxyChoice::Direct;
        self
    }
}

impl From<&str> for EndpointSpec {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for EndpointSpec {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}

/// Derives the fleet-unique device id.
pub fn device_id(name: &str, site: Option<&str>) -> String {
    match site {
        Some(site) => format!("{site},{name}"),
        None => name.to_string(),
    }
}

struct Endpoint {
    label: String,
    session: Session,
    /// Keeps the upstream device, and so its session, alive.
    _proxy: Option<Arc<Device>>,
}

/// A managed network device.
pub struct Device {
    id: String,
    name: String,
    site: Option<String>,
    credentials: Credentials,
    proxy: Option<Arc<Device>>,
    dialect: Arc<dyn Dialect>,
    endpoints: Vec<Endpoint>,
}

impl Device {
    pub fn builder(name: impl Into<String>) -> DeviceBuilder {
        DeviceBuilder::new(name)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn site(&self) -> Option<&str> {
        self.site.as_deref()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Default jump host of the device.
    pub fn proxy(&self) -> Option<&Arc<Device>> {
        self.proxy.as_ref()
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    /// Session of the first endpoint.
    pub fn primary_session(&self) -> Option<&Session> {
        self.endpoints.first().map(|endpoint| &endpoint.session)
    }

    pub fn has_endpoints(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// Sessions with their endpoint labels, in endpoint order.
    pub fn sessions(&self) -> impl Iterator<Item = (&str, &Session)> {
        self.endpoints
            .iter()
            .map(|endpoint| (endpoint.label.as_str(), &endpoint.session))
    }

    pub fn session(&self, label: &str) -> Option<&Session> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.label == label)
            .map(|endpoint| &endpoint.session)
    }

    /// Command verbs on the primary session.
    pub fn cli(&self) -> Option<Cli> {
        self.primary_session()
            .map(|session| Cli::new(session.clone(), self.dialect.clone()))
    }

    /// Disconnects every session of the device.
    pub async fn disconnect(&self) {
        for endpoint in &self.endpoints {
            endpoint.session.disconnect().await;
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("dialect", &self.dialect.name())
            .field(
                "endpoints",
                &self.sessions().map(|(label, _)| label).collect::<Vec<_>>(),
            )
            .field("proxy", &self.proxy.as_ref().map(|proxy| proxy.id()))
            .finish()
    }
}

/// Builder for [`Device`].
pub struct DeviceBuilder {
    name: String,
    site: Option<String>,
    endpoints: Option<Vec<EndpointSpec>>,
    credentials: Credentials,
    proxy: Option<Arc<Device>>,
    dialect: Arc<dyn Dialect>,
}

impl DeviceBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            site: None,
            endpoints: None,
            credentials: Credentials::default(),
            proxy: None,
            dialect: Arc::new(Junos::new()),
        }
    }

    pub fn site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    /// Adds an endpoint. Without any, the device name is the address.
    pub fn endpoint(mut self, endpoint: impl Into<EndpointSpec>) -> Self {
        self.endpoints
            .get_or_insert_with(Vec::new)
            .push(endpoint.into());
        self
    }

    /// Replaces all endpoints; an empty list leaves the device unreachable.
    pub fn endpoints<I, E>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EndpointSpec>,
    {
        self.endpoints = Some(endpoints.into_iter().map(Into::into).collect());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Jump host used by endpoints without an explicit choice.
    pub fn proxy(mut self, proxy: Arc<Device>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Creates the device with one DISCONNECTED session per endpoint.
    pub fn build(self, context: &SessionContext) -> Arc<Device> {
        let id = device_id(&self.name, self.site.as_deref());
        let specs = self
            .endpoints
            .unwrap_or_else(|| vec![EndpointSpec::new(self.name.clone())]);
        let port = context.options.port;

        let endpoints = specs
            .into_iter()
            .enumerate()
            .map(|(position, spec)| {
                let target = Target::new(spec.address, port);
                let proxy = match spec.proxy {
                    ProxyChoice::Default => self.proxy.clone(),
                    ProxyChoice::Direct => None,
                    ProxyChoice::Via(proxy) => Some(proxy),
                };
                let session = match &proxy {
                    None => Session::new(&id, target, self.credentials.clone(), context.clone()),
                    Some(proxy) => {
                        let upstream = proxy.primary_session();
                        if upstream.is_none() {
                            warn!("{id}: proxy {} has no endpoint", proxy.id());
                        }
                        Session::behind(
                            &id,
                            target,
                            self.credentials.clone(),
                            upstream,
                            context.clone(),
                        )
                    }
                };
                Endpoint {
                    label: spec.label.unwrap_or_else(|| position.to_string()),
                    session,
                    _proxy: proxy,
                }
            })
            .collect();

        Arc::new(Device {
            id,
            name: self.name,
            site: self.site,
            credentials: self.credentials,
            proxy: self.proxy,
            dialect: self.dialect,
            endpoints,
        })
    }
}
