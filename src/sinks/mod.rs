//! Remote-store sinks. InfluxDB is the only one today.

pub mod influxdb;
