// Door command dispatch: core-side dispatcher and device-side actuator endpoint

pub mod types;
pub mod dispatcher;
pub mod endpoint;

pub use types::{AckMessage, CommandMessage, DispatchError, DoorCommand, UnlockReceipt};
pub use dispatcher::DoorCommandDispatcher;
pub use endpoint::{ActuatorEndpoint, DoorActuator};
