//! Domain logic for a networked AV control processor: connection
//! lifecycle, driver normalisation, the device/command model, and the
//! event plumbing that ties them together. Built on top of the thin
//! transport primitives in `roomctl-api`.

pub mod config;
pub mod controller;
pub mod device;
pub mod driver;
pub mod error;
pub mod events;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod ui_bindings;

pub use config::{ClientOptions, EndpointDescriptor, PinSource};
pub use controller::{ConnectionState, Controller, ControllerEvent};
pub use device::{Device, DeviceInfo, StateChangeSubscription, StateChangedEvent};
pub use driver::{normalise, DriverDescriptor, NormalizedCategory, NormalizedDriver};
pub use error::CoreError;
pub use events::{EventBus, NamedEvent};
pub use model::{CommandRecord, NormalizedValue, ParamRecord, StateRecord};
