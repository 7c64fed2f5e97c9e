//! # RPC-Bridge
//!
//! Typed message routing between independently running models.
//!
//! # Concepts
//!
//! - [`types`]: every payload is an instance of a registered type. Encoding produces the payload
//!   bytes plus the metadata a receiver needs to decode them.
//! - [`comm`]: a [`Communicator`] is one endpoint of a typed, directional channel. Messages travel
//!   as an [`envelope`] of JSON header and payload.
//! - [`driver`]: a [`ConnectionDriver`] pumps messages from input comms to output comms on its
//!   own thread, until every producer signed off.
//! - [`rpc`]: a [`RequestDriver`] multiplexes requests of many clients onto one server channel,
//!   and routes each reply back through a single-use [`ResponseDriver`].
//!
//! # Usage
//!
//! ```no_run
//! # #[cfg(feature = "in-memory-comm")]
//! # fn main() -> Result<(), rpc_bridge::DriverError> {
//! use rpc_bridge::{comm::memory, CommConfig, ConnectionDriver};
//!
//! let driver = ConnectionDriver::builder("pipe")
//!     .with_input(CommConfig::recv("in", memory::KIND))
//!     .with_output(CommConfig::send("out", memory::KIND))
//!     .with_input_models(["producer"])
//!     .build()?;
//!
//! driver.start()?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "in-memory-comm"))]
//! # fn main() {}
//! ```

/// Re-exported crates
pub extern crate bytes;
pub extern crate serde_json;

pub mod comm;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod message;
pub mod rpc;
pub mod types;

pub use comm::{CommConfig, Communicator, Direction};
pub use driver::{ConnectionBuilder, ConnectionDriver, DriverConfig, RunState, Side};
pub use error::{CommError, DriverError, ErrorKind, TypeError};
pub use message::{CommMessage, Flag, Header};
pub use rpc::{RequestDriver, RequestDriverConfig, ResponseDriver};
pub use types::{TypeCodec, TypeSchema, TypedSerializer};

pub mod prelude {
    pub use crate::{
        comm::{new_comm, Communicator as _},
        types::{TypeCodec as _, TypeSchema as _},
        CommConfig, CommMessage, ConnectionDriver, RequestDriver,
    };
}

assert::assert_impl_all!(CommMessage: Send, Sync);
assert::assert_impl_all!(RequestDriver: Send, Sync);
assert::assert_obj_safe!(Communicator, TypeSchema);
