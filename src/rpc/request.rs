use std::{ops::Deref, time::Duration};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    client_sentinel, ResponseDriver, RouteKey, CLIENT_BEGIN, CLIENT_END, COMMTYPE_KEY,
    REQUEST_ID_KEY, RESPONSE_ADDRESS_KEY,
};
use crate::{
    comm::{CommConfig, Direction},
    driver::{Connection, ConnectionBuilder, ConnectionDriver, DriverConfig, Registry, Relay, Side},
    error::{CommError, DriverError},
    message::{value_token, CommMessage, MODEL_KEY},
};

/// Serializable description of a [`RequestDriver`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDriverConfig {
    #[serde(flatten)]
    pub driver: DriverConfig,

    /// Template of each response driver's input. Defaults to a receiving comm of the same kind as
    /// the server channel. The address is always freshly allocated.
    pub response: Option<CommConfig>,

    /// Reply channel used for requests that don't name one in their header.
    pub client_reply: Option<CommConfig>,
}

/// Relay state: live response drivers by route.
#[derive(Debug, Default)]
pub struct ResponseRoutes {
    drivers: HashMap<RouteKey, ResponseDriver>,

    /// Set once closing began. No route is created afterwards.
    blocked: bool,
}

/// Routes requests to the server and spawns a response driver per request.
#[derive(Debug)]
pub struct RequestRelay {
    response: Option<CommConfig>,
    client_reply: Option<CommConfig>,
    poll_timeout: Duration,
    join_timeout: Duration,
}

/// Forwards requests from any number of clients to one server channel.
///
/// Input models are the clients. A client signing off produces a [`CLIENT_END`] sentinel; the
/// server channel only receives EOF once every client signed off.
pub struct RequestDriver {
    driver: ConnectionDriver<RequestRelay>,
}

// ========================================================== RequestRelay ===|

impl RequestRelay {
    /// Reply channel of a request: the header's route when present, else the configured one.
    fn reply_target(
        &self,
        msg: &CommMessage,
        default_kind: &str,
    ) -> Result<CommConfig, DriverError> {
        if let Some(address) = msg.header_str(RESPONSE_ADDRESS_KEY) {
            let kind = msg.header_str(COMMTYPE_KEY).unwrap_or(default_kind);
            let mut target =
                CommConfig::send(format!("client_reply.{address}"), kind).with_address(address);
            target.typedef = self.response.as_ref().and_then(|x| x.typedef.clone());
            return Ok(target);
        }

        let mut target = self.client_reply.clone().ok_or(DriverError::NoReplyRoute)?;
        target.direction = Direction::Send;
        target.dont_open = false;
        Ok(target)
    }

    fn response_template(&self, conn: &Connection<Self>) -> CommConfig {
        let mut template = self.response.clone().unwrap_or_else(|| {
            let kind = conn.ocomms().first().map(|c| c.kind()).unwrap_or_default();
            CommConfig::recv(String::new(), kind)
        });

        template.name = format!("{}.response", conn.name());
        template.direction = Direction::Recv;
        template.address = None;
        template.dont_open = false;
        template
    }

    /// Builds and starts the response driver of one request.
    fn spawn_route(
        &self,
        conn: &Connection<Self>,
        msg: &CommMessage,
        request_id: String,
    ) -> Result<ResponseDriver, DriverError> {
        let default_kind = conn.ocomms().first().map(|c| c.kind()).unwrap_or_default();
        let target = self.reply_target(msg, default_kind)?;
        let driver = ResponseDriver::new(
            format!("{}.response.{request_id}", conn.name()),
            request_id,
            self.response_template(conn),
            target,
            self.poll_timeout,
            self.join_timeout,
        )?;

        driver.start()?;
        Ok(driver)
    }

    /// Removes every response driver that stopped and whose reply was fully delivered.
    fn prune(&self, conn: &Connection<Self>) -> usize {
        let finished: Vec<ResponseDriver> = {
            let mut reg = conn.lock();
            let keys: Vec<RouteKey> = reg
                .ext
                .drivers
                .iter()
                .filter(|(_, d)| d.is_complete())
                .map(|(k, _)| k.clone())
                .collect();

            keys.iter().filter_map(|k| reg.ext.drivers.remove(k)).collect()
        };

        for driver in &finished {
            tracing::trace!(driver = %conn.name(), route = ?driver.key(), "route completed");
        }

        finished.len()
    }

    /// Blocks new routes, then stops and joins every live response driver.
    fn close_routes(&self, conn: &Connection<Self>) -> usize {
        let drivers: Vec<ResponseDriver> = {
            let mut reg = conn.lock();
            reg.ext.blocked = true;
            reg.ext.drivers.drain().map(|(_, d)| d).collect()
        };

        drivers.iter().for_each(ResponseDriver::terminate);
        for driver in &drivers {
            if !driver.wait(self.join_timeout) {
                tracing::warn!(
                    driver = %conn.name(),
                    route = ?driver.key(),
                    "response driver did not stop in time"
                );
            }
        }

        drivers.len()
    }
}

impl Relay for RequestRelay {
    type State = ResponseRoutes;

    fn before_loop(&self, conn: &Connection<Self>) -> Result<(), CommError> {
        let reg = conn.lock();
        for client in reg.models(Side::Input) {
            conn.forward(client_sentinel(CLIENT_BEGIN, client))?;
        }

        Ok(())
    }

    fn send_message(
        &self,
        conn: &Connection<Self>,
        mut msg: CommMessage,
    ) -> Result<bool, CommError> {
        if msg.is_raw() {
            return conn.forward(msg);
        }
        if conn.ocomms().iter().any(|c| c.is_closed()) {
            tracing::warn!(driver = %conn.name(), "server channel closed; dropping request");
            return Ok(false);
        }

        let model = msg.model().unwrap_or_default().to_string();

        let (key, driver_address, driver_kind, request_id, replaced) = {
            let mut reg = conn.lock();
            if !reg.is_open() || reg.ext.blocked {
                tracing::debug!(driver = %conn.name(), "closing; no new routes");
                return Ok(false);
            }

            if !model.is_empty() && reg.add_model(Side::Input, &model) {
                tracing::info!(driver = %conn.name(), client = %model, "client joined");
                conn.forward(client_sentinel(CLIENT_BEGIN, &model))?;
            }

            let request_id = match msg.header.get(REQUEST_ID_KEY) {
                Some(id) => id.clone(),
                None => Value::from(format!("{:016x}", rand::random::<u64>())),
            };

            let driver = match self.spawn_route(conn, &msg, value_token(&request_id)) {
                Ok(driver) => driver,
                Err(e) => {
                    tracing::warn!(
                        driver = %conn.name(),
                        client = %model,
                        error = %e,
                        "failed to create response route"
                    );
                    return Ok(false);
                }
            };

            let key = driver.key().clone();
            let address = driver.input_address().to_string();
            let kind = driver.input_kind().to_string();
            let replaced = reg.ext.drivers.insert(key.clone(), driver);

            (key, address, kind, request_id, replaced)
        };

        if let Some(prev) = replaced {
            tracing::warn!(
                driver = %conn.name(),
                route = ?prev.key(),
                "route replaced while in flight"
            );
            prev.terminate();
        }

        msg.header.insert(RESPONSE_ADDRESS_KEY.into(), driver_address.into());
        msg.header.insert(REQUEST_ID_KEY.into(), request_id);
        msg.header.insert(MODEL_KEY.into(), model.into());
        msg.header.insert(COMMTYPE_KEY.into(), driver_kind.into());

        let sent = conn.forward(msg);
        if !matches!(sent, Ok(true)) {
            // The request never left; its route would wait forever.
            let orphan = conn.lock().ext.drivers.remove(&key);
            if let Some(orphan) = orphan {
                tracing::debug!(driver = %conn.name(), route = ?key, "request not sent");
                orphan.terminate();
            }
        }

        sent
    }

    fn remove_model(
        &self,
        conn: &Connection<Self>,
        reg: &mut Registry<ResponseRoutes>,
        side: Side,
        name: &str,
    ) -> Result<bool, CommError> {
        if side == Side::Input && reg.models(Side::Input).contains(name) {
            tracing::info!(driver = %conn.name(), client = %name, "client signed off");
            conn.forward(client_sentinel(CLIENT_END, name))?;
        }

        Ok(reg.remove_model(side, name))
    }

    fn after_iteration(&self, conn: &Connection<Self>) {
        self.prune(conn);
    }

    fn before_close(&self, conn: &Connection<Self>) {
        let n = self.close_routes(conn);
        if n > 0 {
            tracing::debug!(
                driver = %conn.name(),
                count = n,
                "terminated pending response drivers"
            );
        }
    }
}

// ========================================================== RequestDriver ===|

impl RequestDriver {
    pub fn new(config: RequestDriverConfig) -> Result<Self, DriverError> {
        let RequestDriverConfig { driver, response, client_reply } = config;
        Self::from_builder(ConnectionBuilder::from_config(driver), response, client_reply)
    }

    /// Builds from a prepared builder, which must describe exactly one output: the server
    /// channel.
    pub fn from_builder(
        builder: ConnectionBuilder,
        response: Option<CommConfig>,
        client_reply: Option<CommConfig>,
    ) -> Result<Self, DriverError> {
        if builder.n_outputs() != 1 {
            return Err(DriverError::Config("request driver needs exactly one output".into()));
        }
        if let Some(response) = &response {
            response.validate()?;
        }

        let relay = RequestRelay {
            response,
            client_reply,
            poll_timeout: builder.config().poll_timeout(),
            join_timeout: builder.config().join_timeout(),
        };

        Ok(Self { driver: builder.build_with(relay)? })
    }

    /// Currently attached clients.
    pub fn clients(&self) -> Vec<String> {
        self.driver.models(Side::Input)
    }

    pub fn n_clients(&self) -> usize {
        self.connection().lock().models(Side::Input).len()
    }

    /// Number of response drivers not yet pruned.
    pub fn n_response_drivers(&self) -> usize {
        self.connection().lock().ext.drivers.len()
    }

    /// Whether a route for this reply address and request id is live.
    pub fn has_route(&self, response_address: &str, request_id: &str) -> bool {
        let key = RouteKey {
            response_address: response_address.to_string(),
            request_id: request_id.to_string(),
        };
        self.connection().lock().ext.drivers.contains_key(&key)
    }

    /// Whether the response driver of a route is still running. `None` if there's no such
    /// route.
    pub fn is_route_alive(&self, response_address: &str, request_id: &str) -> Option<bool> {
        let key = RouteKey {
            response_address: response_address.to_string(),
            request_id: request_id.to_string(),
        };
        self.connection().lock().ext.drivers.get(&key).map(ResponseDriver::is_alive)
    }

    /// Removes completed response drivers. Returns how many were removed.
    pub fn prune_response_drivers(&self) -> usize {
        self.connection().relay().prune(self.connection())
    }

    /// Stops every response driver and refuses new routes from now on.
    pub fn close_response_drivers(&self) -> usize {
        self.connection().relay().close_routes(self.connection())
    }
}

impl Deref for RequestDriver {
    type Target = ConnectionDriver<RequestRelay>;

    fn deref(&self) -> &Self::Target {
        &self.driver
    }
}

impl std::fmt::Debug for RequestDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDriver")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("clients", &self.clients())
            .field("n_response_drivers", &self.n_response_drivers())
            .finish()
    }
}
