pub mod logging;
pub mod net_utils;
