use crate::config::ClientConfig;
use std::collections::HashMap;

pub const LOCATION_HEADER: &str = "Location";
pub const LOCATION_URI_INTENT_HEADER: &str = "x-location-uri-intent";
pub const LOCATION_URI_INTENT_TRANSACTION_URL: &str = "transaction-url";
pub const SERVER_TRANSACTION_TTL_HEADER: &str = "x-nifi-site-to-site-server-transaction-ttl";

pub const HANDSHAKE_USE_COMPRESSION: &str = "x-nifi-site-to-site-use-compression";
pub const HANDSHAKE_REQUEST_EXPIRATION: &str = "x-nifi-site-to-site-request-expiration";
pub const HANDSHAKE_BATCH_COUNT: &str = "x-nifi-site-to-site-batch-count";
pub const HANDSHAKE_BATCH_SIZE: &str = "x-nifi-site-to-site-batch-size";
pub const HANDSHAKE_BATCH_DURATION: &str = "x-nifi-site-to-site-batch-duration";

/// Site-to-Site response codes this client puts on the wire when ending a
/// transaction. The protocol defines a wider table, but a send-only client
/// never emits the other codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    ConfirmTransaction = 12,
    CancelTransaction = 15,
    BadChecksum = 19,
}

impl ResponseCode {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Handshake properties sent as headers on every request within a
/// transaction. A property is included only when its source config value is
/// present and positive.
pub fn handshake_properties(config: &ClientConfig) -> HashMap<String, String> {
    let mut properties = HashMap::new();

    if config.use_compression {
        properties.insert(HANDSHAKE_USE_COMPRESSION.to_string(), "true".to_string());
    }

    if config.idle_connection_expiration_millis > 0 {
        properties.insert(
            HANDSHAKE_REQUEST_EXPIRATION.to_string(),
            config.idle_connection_expiration_millis.to_string(),
        );
    }

    if config.preferred_batch_count > 0 {
        properties.insert(
            HANDSHAKE_BATCH_COUNT.to_string(),
            config.preferred_batch_count.to_string(),
        );
    }

    if config.preferred_batch_size_bytes > 0 {
        properties.insert(
            HANDSHAKE_BATCH_SIZE.to_string(),
            config.preferred_batch_size_bytes.to_string(),
        );
    }

    if config.preferred_batch_duration_millis > 0 {
        properties.insert(
            HANDSHAKE_BATCH_DURATION.to_string(),
            config.preferred_batch_duration_millis.to_string(),
        );
    }

    properties
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitted_codes() {
        assert_eq!(ResponseCode::ConfirmTransaction.code(), 12);
        assert_eq!(ResponseCode::CancelTransaction.code(), 15);
        assert_eq!(ResponseCode::BadChecksum.code(), 19);
    }

    #[test]
    fn test_handshake_properties_skip_unset_values() {
        let mut config = ClientConfig::new("port-1", vec!["http://localhost/nifi-api".into()]);
        config.use_compression = false;
        config.idle_connection_expiration_millis = 0;
        config.preferred_batch_count = 0;
        config.preferred_batch_size_bytes = 0;
        config.preferred_batch_duration_millis = 0;

        assert!(handshake_properties(&config).is_empty());
    }

    #[test]
    fn test_handshake_properties_full() {
        let mut config = ClientConfig::new("port-1", vec!["http://localhost/nifi-api".into()]);
        config.use_compression = true;
        config.idle_connection_expiration_millis = 30_000;
        config.preferred_batch_count = 100;
        config.preferred_batch_size_bytes = 1024;
        config.preferred_batch_duration_millis = 500;

        let properties = handshake_properties(&config);
        assert_eq!(properties.get(HANDSHAKE_USE_COMPRESSION).unwrap(), "true");
        assert_eq!(properties.get(HANDSHAKE_REQUEST_EXPIRATION).unwrap(), "30000");
        assert_eq!(properties.get(HANDSHAKE_BATCH_COUNT).unwrap(), "100");
        assert_eq!(properties.get(HANDSHAKE_BATCH_SIZE).unwrap(), "1024");
        assert_eq!(properties.get(HANDSHAKE_BATCH_DURATION).unwrap(), "500");
    }
}
