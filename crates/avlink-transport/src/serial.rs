//! Serial port channel.
//!
//! This module provides [`SerialChannel`], which implements the [`Channel`]
//! trait for USB virtual COM ports and RS-232 control ports. Most matrix
//! switchers ship with a DB9 control port at 9600 or 115200 baud, 8N1, no
//! flow control.
//!
//! The port is opened on [`connect`](Channel::connect) and split: writes go
//! straight to the write half, while a background task forwards everything
//! read to the link's [`EventSink`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use avlink_core::error::{Error, Result};
use avlink_core::{Channel, ConnectionKind, EventSink};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::reader::spawn_reader;

/// Control port line settings.
///
/// Switcher manuals quote these as a baud rate and a character format, e.g.
/// `9600,8N1`; [`FromStr`] accepts that notation. Only the settings such
/// ports actually use are representable: 7 or 8 data bits, optional parity,
/// 1 or 2 stop bits, and RTS/CTS as the only flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    /// `9600,8N1`, no flow control.
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl fmt::Display for SerialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self.data_bits {
            DataBits::Seven => '7',
            DataBits::Eight => '8',
        };
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        let stop = match self.stop_bits {
            StopBits::One => '1',
            StopBits::Two => '2',
        };
        write!(f, "{},{bits}{parity}{stop}", self.baud_rate)?;
        if self.flow_control == FlowControl::RtsCts {
            write!(f, ",rtscts")?;
        }
        Ok(())
    }
}

impl FromStr for SerialConfig {
    type Err = Error;

    /// Parse `<baud>,<bits><parity><stop>[,rtscts]`, e.g. `19200,7E1`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidParameter(format!("invalid serial settings: {s:?}"));
        let mut parts = s.split(',').map(str::trim);

        let baud_rate = parts
            .next()
            .and_then(|b| b.parse::<u32>().ok())
            .filter(|b| *b > 0)
            .ok_or_else(invalid)?;

        let format = parts.next().unwrap_or("8N1").as_bytes();
        let [bits, parity, stop] = format else {
            return Err(invalid());
        };
        let data_bits = match bits {
            b'7' => DataBits::Seven,
            b'8' => DataBits::Eight,
            _ => return Err(invalid()),
        };
        let parity = match parity.to_ascii_uppercase() {
            b'N' => Parity::None,
            b'O' => Parity::Odd,
            b'E' => Parity::Even,
            _ => return Err(invalid()),
        };
        let stop_bits = match stop {
            b'1' => StopBits::One,
            b'2' => StopBits::Two,
            _ => return Err(invalid()),
        };

        let flow_control = match parts.next() {
            None => FlowControl::None,
            Some(flow) if flow.eq_ignore_ascii_case("rtscts") => FlowControl::RtsCts,
            Some(_) => return Err(invalid()),
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(SerialConfig {
            baud_rate,
            data_bits,
            parity,
            stop_bits,
            flow_control,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    /// Hardware handshake on the RTS/CTS lines.
    RtsCts,
}

impl SerialConfig {
    fn builder(&self, path: &str) -> tokio_serial::SerialPortBuilder {
        tokio_serial::new(path, self.baud_rate)
            .data_bits(match self.data_bits {
                DataBits::Seven => tokio_serial::DataBits::Seven,
                DataBits::Eight => tokio_serial::DataBits::Eight,
            })
            .parity(match self.parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Odd => tokio_serial::Parity::Odd,
                Parity::Even => tokio_serial::Parity::Even,
            })
            .stop_bits(match self.stop_bits {
                StopBits::One => tokio_serial::StopBits::One,
                StopBits::Two => tokio_serial::StopBits::Two,
            })
            .flow_control(match self.flow_control {
                FlowControl::None => tokio_serial::FlowControl::None,
                FlowControl::RtsCts => tokio_serial::FlowControl::Hardware,
            })
    }
}

/// Serial port channel.
pub struct SerialChannel {
    path: String,
    config: SerialConfig,
    writer: Option<WriteHalf<SerialStream>>,
    reader: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl SerialChannel {
    /// Create a closed channel for `path` (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn new(path: impl Into<String>, config: SerialConfig) -> Self {
        SerialChannel {
            path: path.into(),
            config,
            writer: None,
            reader: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn open(&self) -> Result<SerialStream> {
        tracing::debug!(port = %self.path, settings = %self.config, "opening serial port");

        self.config
            .builder(&self.path)
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %self.path, error = %e, "failed to open serial port");
                Error::Transport(format!("failed to open serial port {}: {}", self.path, e))
            })
    }
}

#[async_trait]
impl Channel for SerialChannel {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Serial
    }

    async fn connect(&mut self, sink: EventSink) -> Result<()> {
        self.disconnect().await?;

        let stream = self.open()?;
        let (read_half, write_half) = tokio::io::split(stream);

        self.connected.store(true, Ordering::SeqCst);
        self.reader = Some(spawn_reader(
            read_half,
            sink.clone(),
            Arc::clone(&self.connected),
            self.path.clone(),
        ));
        self.writer = Some(write_half);

        tracing::info!(port = %self.path, settings = %self.config, "serial port opened");
        sink.online();
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(port = %self.path, bytes = payload.len(), data = ?payload, "sending data");

        writer.write_all(payload).await.map_err(|e| {
            tracing::error!(port = %self.path, error = %e, "failed to send data");
            Error::from_io(e)
        })?;
        writer.flush().await.map_err(|e| {
            tracing::error!(port = %self.path, error = %e, "failed to flush serial port");
            Error::from_io(e)
        })?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.take() {
            tracing::debug!(port = %self.path, "closing serial port");
            if let Err(e) = writer.flush().await {
                tracing::warn!(
                    port = %self.path,
                    error = %e,
                    "failed to flush before closing (continuing anyway)"
                );
            }
            tracing::info!(port = %self.path, "serial port closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some() && self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn default_is_9600_8n1() {
        let config = SerialConfig::default();
        assert_eq!(config.to_string(), "9600,8N1");
        assert_eq!(config.flow_control, FlowControl::None);
    }

    #[test]
    fn parses_manual_notation() {
        let config: SerialConfig = "19200,7E1".parse().unwrap();
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.data_bits, DataBits::Seven);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.stop_bits, StopBits::One);

        let config: SerialConfig = "115200".parse().unwrap();
        assert_eq!(config, SerialConfig { baud_rate: 115_200, ..Default::default() });

        let config: SerialConfig = "38400, 8n2, RTSCTS".parse().unwrap();
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::Two);
        assert_eq!(config.flow_control, FlowControl::RtsCts);
        assert_eq!(config.to_string(), "38400,8N2,rtscts");
    }

    #[test]
    fn rejects_malformed_settings() {
        for bad in [
            "",
            "fast",
            "0,8N1",
            "9600,5N1",
            "9600,8X1",
            "9600,8N3",
            "9600,8N",
            "9600,8N1,xon",
            "9600,8N1,rtscts,x",
        ] {
            assert!(
                matches!(bad.parse::<SerialConfig>(), Err(Error::InvalidParameter(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn closed_channel_rejects_send() {
        let mut channel = SerialChannel::new("/dev/ttyUSB0", SerialConfig::default());
        assert_eq!(channel.kind(), ConnectionKind::Serial);
        assert_eq!(channel.control_method(), "serial");
        assert!(!channel.is_connected());
        assert!(matches!(
            channel.send(b"OUT1 IN2!\r\n").await,
            Err(Error::NotConnected)
        ));
        // Closing a closed channel is a no-op.
        channel.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn missing_port_fails_to_connect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = SerialChannel::new(
            "/dev/avlink-no-such-port",
            SerialConfig {
                baud_rate: 115_200,
                ..Default::default()
            },
        );

        let result = channel.connect(EventSink::new(1, tx)).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(!channel.is_connected());
        assert!(rx.try_recv().is_err());
    }
}
