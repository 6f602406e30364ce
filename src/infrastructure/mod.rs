pub mod bluetooth;
pub mod csv_sink;
pub mod logging;
