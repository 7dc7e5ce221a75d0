pub mod device;
pub mod logging;
pub mod serial;
