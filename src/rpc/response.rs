use std::time::Duration;

use crate::{
    comm::{CommConfig, Communicator},
    driver::{Connection, ConnectionBuilder, ConnectionDriver, Registry, Relay, RunState, Side},
    error::{CommError, DriverError},
    message::CommMessage,
};

/// Identifies one in-flight request: the client's reply address and its request id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub response_address: String,
    pub request_id: String,
}

/// Carries exactly one reply, then stops.
#[derive(Debug, Default)]
pub struct ResponseRelay;

/// Single-use driver delivering the reply to one request.
///
/// Its input is a fresh address the server replies to; its output is the client's reply channel.
pub struct ResponseDriver {
    driver: ConnectionDriver<ResponseRelay>,
    key: RouteKey,
}

// ========================================================== ResponseRelay ===|

impl Relay for ResponseRelay {
    type State = ();

    fn send_message(&self, conn: &Connection<Self>, msg: CommMessage) -> Result<bool, CommError> {
        let delivered = conn.forward(msg)?;
        if delivered {
            tracing::debug!(driver = %conn.name(), "reply delivered");
            conn.request_stop();
        }
        Ok(delivered)
    }

    fn remove_model(
        &self,
        conn: &Connection<Self>,
        reg: &mut Registry<()>,
        _side: Side,
        _name: &str,
    ) -> Result<bool, CommError> {
        // The server hung up without replying. The client's channel isn't ours to end.
        tracing::debug!(driver = %conn.name(), "server closed without reply");
        reg.begin_closing();
        Ok(false)
    }

    fn on_rejected(&self, conn: &Connection<Self>, err: CommError) -> bool {
        conn.fail(CommError::Config(format!("reply doesn't match the reply type: {err}").into()));
        false
    }
}

// ========================================================== ResponseDriver ===|

impl ResponseDriver {
    /// Creates the driver. `input` is the reply template, and gets a fresh address when it has
    /// none; `output` is the client's reply channel.
    pub fn new(
        name: impl Into<String>,
        key_request_id: String,
        input: CommConfig,
        output: CommConfig,
        poll_timeout: Duration,
        join_timeout: Duration,
    ) -> Result<Self, DriverError> {
        let response_address = output.address.clone().ok_or(DriverError::NoReplyRoute)?;

        let driver = ConnectionBuilder::new(name)
            .with_input(input)
            .with_output(output)
            .with_poll_timeout(poll_timeout)
            .with_join_timeout(join_timeout)
            .build_with(ResponseRelay)?;

        Ok(Self { driver, key: RouteKey { response_address, request_id: key_request_id } })
    }

    pub fn key(&self) -> &RouteKey {
        &self.key
    }

    /// Address the server replies to.
    pub fn input_address(&self) -> &str {
        self.icomm().address()
    }

    /// Transport kind of [`Self::input_address`].
    pub fn input_kind(&self) -> &str {
        self.icomm().kind()
    }

    pub fn start(&self) -> Result<(), DriverError> {
        self.driver.start()
    }

    pub fn state(&self) -> RunState {
        self.driver.state()
    }

    pub fn is_alive(&self) -> bool {
        self.driver.is_alive()
    }

    /// Force-stops the driver, closing its comms right away.
    pub fn terminate(&self) {
        self.driver.terminate();
        for comm in self.conn().icomms().iter().chain(self.conn().ocomms()) {
            comm.close();
        }
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        self.driver.wait(timeout)
    }

    /// Stopped, and its reply was both drained from the input and taken by the client.
    pub fn is_complete(&self) -> bool {
        !self.is_alive() && self.icomm().is_confirmed_recv() && self.ocomm().is_confirmed_send()
    }

    pub fn n_sent(&self) -> u64 {
        self.driver.n_sent()
    }

    fn conn(&self) -> &Connection<ResponseRelay> {
        self.driver.connection()
    }

    fn icomm(&self) -> &dyn Communicator {
        // The builder guarantees one input and one output.
        &*self.conn().icomms()[0]
    }

    fn ocomm(&self) -> &dyn Communicator {
        &*self.conn().ocomms()[0]
    }
}

impl std::fmt::Debug for ResponseDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseDriver")
            .field("name", &self.driver.name())
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}
