pub mod bluetooth;
pub mod clock;
pub mod logging;
