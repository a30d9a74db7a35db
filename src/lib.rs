pub mod bindings;
pub mod display;
pub mod input;

pub use bindings::{Binding, Bindings};
pub use display::{BrightnessCoordinator, DdcDisplay, VcpDevice};
pub use input::InputMultiplexer;
