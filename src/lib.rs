//! Host-side link to a single BLE peripheral: discovery, connection
//! lifecycle, short text messaging and sentinel-terminated CSV transfers.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
