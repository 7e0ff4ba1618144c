//! Field-data sources. OPC UA is the only one today.

pub mod opcua;
