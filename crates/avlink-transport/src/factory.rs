//! Building channels from endpoint settings.

use std::time::Duration;

use avlink_core::{Channel, ChannelFactory, ConnectionKind};

use crate::http::{HttpChannel, DEFAULT_REQUEST_TIMEOUT};
use crate::ir::{GatewayEmitter, IrChannel};
use crate::serial::{SerialChannel, SerialConfig};
use crate::tcp::{TcpChannel, DEFAULT_CONNECT_TIMEOUT};
use crate::tcp_server::TcpServerChannel;

/// Where each transport reaches the switcher.
///
/// A transport with no endpoint configured cannot be created; binding it
/// leaves the link with no channel until another binding takes precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub serial_path: Option<String>,
    pub serial: SerialConfig,
    /// `host:port` to connect to in network client mode.
    pub tcp_addr: Option<String>,
    /// `host:port` to listen on in network server mode.
    pub listen_addr: Option<String>,
    /// Prefix every HTTP payload is appended to, e.g. `http://10.0.0.5`.
    pub base_url: Option<String>,
    /// `host:port` of the IR gateway.
    pub ir_gateway: Option<String>,
    /// Emitter output on multi-port IR gateways.
    pub ir_port: Option<u8>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            serial_path: None,
            serial: SerialConfig::default(),
            tcp_addr: None,
            listen_addr: None,
            base_url: None,
            ir_gateway: None,
            ir_port: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// [`ChannelFactory`] backed by the concrete channels in this crate.
#[derive(Debug, Clone, Default)]
pub struct TransportFactory {
    settings: TransportSettings,
}

impl TransportFactory {
    pub fn new(settings: TransportSettings) -> Self {
        TransportFactory { settings }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Whether an endpoint is configured for `kind`.
    pub fn supports(&self, kind: ConnectionKind) -> bool {
        let s = &self.settings;
        match kind {
            ConnectionKind::Serial => s.serial_path.is_some(),
            ConnectionKind::Network => s.tcp_addr.is_some(),
            ConnectionKind::NetworkServer => s.listen_addr.is_some(),
            ConnectionKind::Url => s.base_url.is_some(),
            ConnectionKind::Ir => s.ir_gateway.is_some(),
            ConnectionKind::None => false,
        }
    }
}

impl ChannelFactory for TransportFactory {
    fn create(&mut self, kind: ConnectionKind) -> Option<Box<dyn Channel>> {
        let s = &self.settings;
        let channel: Box<dyn Channel> = match kind {
            ConnectionKind::Serial => {
                Box::new(SerialChannel::new(s.serial_path.clone()?, s.serial.clone()))
            }
            ConnectionKind::Network => Box::new(TcpChannel::with_timeout(
                s.tcp_addr.clone()?,
                s.connect_timeout,
            )),
            ConnectionKind::NetworkServer => {
                Box::new(TcpServerChannel::new(s.listen_addr.clone()?))
            }
            ConnectionKind::Url => Box::new(HttpChannel::with_timeout(
                s.base_url.clone()?,
                s.request_timeout,
            )),
            ConnectionKind::Ir => {
                let mut emitter =
                    GatewayEmitter::new(s.ir_gateway.clone()?).with_timeout(s.connect_timeout);
                if let Some(port) = s.ir_port {
                    emitter = emitter.with_port(port);
                }
                Box::new(IrChannel::new(Box::new(emitter)))
            }
            ConnectionKind::None => return None,
        };
        tracing::debug!(method = %kind, "created channel");
        Some(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> TransportSettings {
        TransportSettings {
            serial_path: Some("/dev/ttyUSB0".into()),
            tcp_addr: Some("10.0.0.5:23".into()),
            listen_addr: Some("0.0.0.0:4999".into()),
            base_url: Some("http://10.0.0.5".into()),
            ir_gateway: Some("10.0.0.9:4998".into()),
            ir_port: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn creates_each_configured_kind() {
        let mut factory = TransportFactory::new(full());
        for kind in [
            ConnectionKind::Serial,
            ConnectionKind::Network,
            ConnectionKind::NetworkServer,
            ConnectionKind::Url,
            ConnectionKind::Ir,
        ] {
            assert!(factory.supports(kind));
            let channel = factory.create(kind).unwrap();
            assert_eq!(channel.kind(), kind);
            assert!(!channel.is_connected());
        }
        assert!(factory.create(ConnectionKind::None).is_none());
    }

    #[test]
    fn missing_endpoint_yields_none() {
        let mut factory = TransportFactory::new(TransportSettings {
            serial_path: Some("/dev/ttyS0".into()),
            ..Default::default()
        });
        assert!(factory.create(ConnectionKind::Serial).is_some());
        assert!(!factory.supports(ConnectionKind::Network));
        assert!(factory.create(ConnectionKind::Network).is_none());
        assert!(factory.create(ConnectionKind::Url).is_none());
        assert!(factory.create(ConnectionKind::Ir).is_none());
    }

    #[test]
    fn default_timeouts() {
        let settings = TransportSettings::default();
        assert_eq!(settings.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(settings.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(settings.serial, SerialConfig::default());
    }
}
