//! Bench Device
//!
//! Owns the transport to a bench controller and runs its lifecycle:
//! open, identify, connected (keepalive + telemetry), teardown.
//!
//! Commands and responses are correlated purely by serialization: the bench
//! answers on the Text channel without a request id, so only one command may
//! be in flight. The command lock covers the whole write + wait sequence.

mod error;
mod transport;

pub use error::DeviceError;
pub use transport::{
    list_ports, AsyncStream, Connector, PortInfo, SerialConnector, StreamConnector, Transport,
};

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::protocol::{
    Channel, ChecksumPolicy, Command, Frame, Telemetry, TokenCodec, COMMANDS, DEFAULT_BAUD_RATE,
    DEFAULT_TIMEOUT_MS,
};
use crate::signal::CancelSignal;
use crate::value::Value;

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Not connected (initial and terminal state)
    Disconnected,
    /// Transport open, waiting for the bench to answer `id`
    Identifying,
    /// Identified; telemetry is delivered
    Connected,
    /// Disconnect callback in progress
    Disconnecting,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Identifying => "identifying",
            DeviceStatus::Connected => "connected",
            DeviceStatus::Disconnecting => "disconnecting",
        })
    }
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Connection string (serial port path)
    pub dsn: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Default `Control` response deadline in milliseconds
    pub timeout_ms: u64,
    /// Keepalive ping period in milliseconds
    pub keepalive_interval_ms: u64,
    /// How long startup keeps asking for `id`
    pub identify_timeout_ms: u64,
    /// Pause between `id` attempts
    pub identify_backoff_ms: u64,
    /// Frame trailer validation
    pub checksum: ChecksumPolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            keepalive_interval_ms: 100,
            identify_timeout_ms: 1000,
            identify_backoff_ms: 50,
            checksum: ChecksumPolicy::default(),
        }
    }
}

impl DeviceConfig {
    /// Default configuration for the given port
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            ..Self::default()
        }
    }
}

/// Host hooks invoked from the device's own tasks
///
/// Callbacks run inline in the read loop (telemetry) or under the lifecycle
/// lock (connect/disconnect); one that never returns stalls the device.
#[async_trait]
pub trait DeviceCallbacks: Send + Sync {
    /// Bench identified. An error aborts startup.
    async fn on_connect(&self, _device: &Device) -> anyhow::Result<()> {
        Ok(())
    }

    /// One telemetry record, in arrival order, only while connected
    async fn on_telemetry(&self, _device: &Device, _telemetry: &Telemetry) -> anyhow::Result<()> {
        Ok(())
    }

    /// Connection lost or torn down
    async fn on_disconnect(&self, _device: &Device) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Callbacks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallbacks;

impl DeviceCallbacks for NoCallbacks {}

struct ControlChannel {
    writer: Option<WriteHalf<Transport>>,
    response: watch::Receiver<Option<String>>,
}

struct DeviceInner {
    config: DeviceConfig,
    connector: Box<dyn Connector>,
    callbacks: Arc<dyn DeviceCallbacks>,
    id: StdMutex<Option<String>>,
    status: StdMutex<DeviceStatus>,
    /// Serializes status transitions together with their callbacks
    lifecycle: Mutex<()>,
    /// Serializes commands; owns the write half of the transport
    control: Mutex<ControlChannel>,
    /// Pending-response slot, written by the read loop
    response: watch::Sender<Option<String>>,
    signal: StdMutex<Option<CancelSignal>>,
    tasks: TaskTracker,
}

/// Handle to a bench controller
///
/// Cheap to clone; all clones drive the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Device {
    /// Create a device on a serial port
    pub fn new(config: DeviceConfig, callbacks: Arc<dyn DeviceCallbacks>) -> Self {
        let connector = SerialConnector::new(config.baud_rate);
        Self::with_connector(config, connector, callbacks)
    }

    /// Create a device on a custom transport
    pub fn with_connector(
        config: DeviceConfig,
        connector: impl Connector + 'static,
        callbacks: Arc<dyn DeviceCallbacks>,
    ) -> Self {
        let (response, response_rx) = watch::channel(None);
        Self {
            inner: Arc::new(DeviceInner {
                config,
                connector: Box::new(connector),
                callbacks,
                id: StdMutex::new(None),
                status: StdMutex::new(DeviceStatus::Disconnected),
                lifecycle: Mutex::new(()),
                control: Mutex::new(ControlChannel {
                    writer: None,
                    response: response_rx,
                }),
                response,
                signal: StdMutex::new(None),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Bench identifier, known once identification succeeded
    pub fn id(&self) -> Option<String> {
        lock(&self.inner.id).clone()
    }

    /// Current lifecycle state
    pub fn status(&self) -> DeviceStatus {
        *lock(&self.inner.status)
    }

    /// Connection string
    pub fn dsn(&self) -> &str {
        &self.inner.config.dsn
    }

    /// Commands this device accepts through [`Device::control`]
    pub fn methods(&self) -> &'static [&'static str] {
        &COMMANDS
    }

    fn set_status(&self, status: DeviceStatus) {
        *lock(&self.inner.status) = status;
    }

    fn session(&self) -> Option<CancelSignal> {
        lock(&self.inner.signal).clone()
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.config.timeout_ms)
    }

    /// Open the transport, start the background tasks and identify the bench
    ///
    /// The device's tasks observe a child of `parent`; when the session ends on
    /// its own (transport lost) that child carries the reason.
    pub async fn startup(&self, parent: &CancelSignal) -> Result<(), DeviceError> {
        let config = &self.inner.config;
        let transport = self.inner.connector.open(&config.dsn)?;
        if config.checksum == ChecksumPolicy::Ignore {
            warn!(dsn = %config.dsn, "frame checksum validation is disabled");
        }

        let (reader, writer) = tokio::io::split(transport);
        self.inner.control.lock().await.writer = Some(writer);
        self.inner.response.send_replace(None);

        let signal = parent.child();
        *lock(&self.inner.signal) = Some(signal.clone());
        self.set_status(DeviceStatus::Identifying);

        self.inner.tasks.reopen();
        self.inner.tasks.spawn(self.clone().keepalive(signal.clone()));
        self.inner
            .tasks
            .spawn(self.clone().read_loop(reader, signal.clone()));

        let result = match self.identify(&signal).await {
            Ok(id) => {
                info!(dsn = %config.dsn, %id, "bench identified");
                self.connect().await
            }
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            signal.cancel_with(anyhow::anyhow!("startup failed: {err}"));
            self.wait_tasks().await;
            return Err(err);
        }

        if signal.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        Ok(())
    }

    /// Stop all tasks, close the transport and run the disconnect logic
    pub async fn teardown(&self) {
        let Some(signal) = self.session() else {
            return;
        };
        signal.cancel();
        self.wait_tasks().await;
        self.close().await;
        self.disconnect().await;
    }

    /// Issue a command and wait for its response with the default deadline
    pub async fn control(&self, name: &str, args: &[Value]) -> Result<Option<String>, DeviceError> {
        self.control_with_deadline(name, args, self.default_timeout())
            .await
    }

    /// Issue a command; a zero deadline sends it without waiting (`Ok(None)`)
    pub async fn control_with_deadline(
        &self,
        name: &str,
        args: &[Value],
        deadline: Duration,
    ) -> Result<Option<String>, DeviceError> {
        let command = Command::parse(name, args)?;

        if command == Command::Id {
            if let Some(id) = self.id() {
                return Ok(Some(id));
            }
        }

        if deadline.is_zero() {
            self.post(command, self.default_timeout()).await?;
            return Ok(None);
        }

        let reply = self.request(command, deadline).await?;
        if command == Command::Id {
            *lock(&self.inner.id) = Some(reply.clone());
        }
        Ok(Some(reply))
    }

    async fn write_line(chan: &mut ControlChannel, command: Command) -> Result<(), DeviceError> {
        let writer = chan.writer.as_mut().ok_or(DeviceError::NotOpen)?;
        let line = command.to_line();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        debug!(line = line.trim_end(), "command sent");
        Ok(())
    }

    /// Fire-and-forget; gives up when the line cannot be written within `limit`
    async fn post(&self, command: Command, limit: Duration) -> Result<(), DeviceError> {
        let signal = self.session().ok_or(DeviceError::NotOpen)?;

        let send = async {
            let mut chan = self.inner.control.lock().await;
            self.inner.response.send_replace(None);
            Self::write_line(&mut chan, command).await
        };

        tokio::select! {
            _ = signal.cancelled() => Err(DeviceError::Cancelled),
            sent = tokio::time::timeout(limit, send) => sent.unwrap_or_else(|_| {
                Err(DeviceError::WriteTimeout {
                    command: command.name(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }),
        }
    }

    /// Lock, write and wait for the reply, all within `deadline`
    async fn request(&self, command: Command, deadline: Duration) -> Result<String, DeviceError> {
        let signal = self.session().ok_or(DeviceError::NotOpen)?;

        let exchange = async {
            let mut chan = self.inner.control.lock().await;
            self.inner.response.send_replace(None);
            Self::write_line(&mut chan, command).await?;

            let slot = chan
                .response
                .wait_for(Option::is_some)
                .await
                .map_err(|_| DeviceError::NotOpen)?;
            let text = (*slot).clone().unwrap_or_default();
            Ok::<_, DeviceError>(text)
        };

        tokio::select! {
            _ = signal.cancelled() => Err(DeviceError::Cancelled),
            reply = tokio::time::timeout(deadline, exchange) => reply.unwrap_or_else(|_| {
                Err(DeviceError::ControlTimeout {
                    command: command.name(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }),
        }
    }

    async fn identify(&self, signal: &CancelSignal) -> Result<String, DeviceError> {
        let config = &self.inner.config;
        let deadline = Instant::now() + Duration::from_millis(config.identify_timeout_ms);
        let backoff = Duration::from_millis(config.identify_backoff_ms);

        loop {
            let err = match self.request(Command::Id, self.default_timeout()).await {
                Ok(id) => {
                    *lock(&self.inner.id) = Some(id.clone());
                    return Ok(id);
                }
                Err(DeviceError::Cancelled) => return Err(DeviceError::Cancelled),
                Err(err) => err,
            };

            if Instant::now() >= deadline {
                return Err(err);
            }
            debug!(%err, "identification attempt failed");

            tokio::select! {
                _ = signal.cancelled() => return Err(DeviceError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn connect(&self) -> Result<(), DeviceError> {
        let _transition = self.inner.lifecycle.lock().await;
        if self.status() != DeviceStatus::Identifying {
            return Ok(());
        }

        self.inner
            .callbacks
            .on_connect(self)
            .await
            .map_err(DeviceError::Callback)?;
        self.set_status(DeviceStatus::Connected);
        info!(dsn = %self.dsn(), "connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let _transition = self.inner.lifecycle.lock().await;
        match self.status() {
            DeviceStatus::Connected => {
                self.set_status(DeviceStatus::Disconnecting);
                if let Err(err) = self.inner.callbacks.on_disconnect(self).await {
                    warn!("disconnect callback failed: {err:#}");
                }
                self.set_status(DeviceStatus::Disconnected);
                info!(dsn = %self.dsn(), "disconnected");
            }
            DeviceStatus::Disconnected => {}
            DeviceStatus::Identifying | DeviceStatus::Disconnecting => {
                self.set_status(DeviceStatus::Disconnected);
            }
        }
    }

    async fn close(&self) {
        let limit = self.default_timeout();
        let Ok(mut chan) = tokio::time::timeout(limit, self.inner.control.lock()).await else {
            warn!(dsn = %self.dsn(), "command channel still busy, transport left open");
            return;
        };
        let Some(mut writer) = chan.writer.take() else {
            return;
        };
        drop(chan);

        match tokio::time::timeout(limit, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(%err, "transport shutdown failed"),
            Err(_) => debug!("transport shutdown timed out"),
        }
    }

    async fn wait_tasks(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    async fn keepalive(self, signal: CancelSignal) {
        let interval = Duration::from_millis(self.inner.config.keepalive_interval_ms);
        while !signal.is_cancelled() {
            if let Err(err) = self.post(Command::Ping, interval).await {
                debug!(%err, "keepalive ping failed");
            }
            tokio::select! {
                _ = signal.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn read_loop(self, reader: ReadHalf<Transport>, signal: CancelSignal) {
        let mut tokens = FramedRead::new(reader, TokenCodec::new());

        let cause: Option<anyhow::Error> = loop {
            let next = tokio::select! {
                _ = signal.cancelled() => break None,
                next = tokens.next() => next,
            };
            match next {
                Some(Ok(token)) => self.dispatch(&token).await,
                Some(Err(err)) => break Some(err.into()),
                None => break Some(DeviceError::TransportClosed.into()),
            }
        };
        drop(tokens);

        self.close().await;
        self.disconnect().await;

        match cause {
            Some(err) => {
                warn!(dsn = %self.dsn(), "read loop ended: {err:#}");
                signal.cancel_with(err);
            }
            None => signal.cancel(),
        }
    }

    async fn dispatch(&self, token: &[u8]) {
        if token.is_empty() {
            return;
        }

        let frame = match Frame::parse(token, self.inner.config.checksum) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "discarding frame");
                return;
            }
        };

        match frame.channel {
            Channel::Text => {
                let text = String::from_utf8_lossy(&frame.payload).into_owned();
                debug!(%text, "response");
                if !text.is_empty() {
                    self.inner.response.send_replace(Some(text));
                }
            }
            Channel::Data => match Telemetry::decode(&frame.payload) {
                Ok(telemetry) => self.deliver(&telemetry).await,
                Err(err) => warn!(%err, "discarding telemetry"),
            },
        }
    }

    async fn deliver(&self, telemetry: &Telemetry) {
        if self.status() != DeviceStatus::Connected {
            return;
        }
        if let Err(err) = self.inner.callbacks.on_telemetry(self, telemetry).await {
            warn!("telemetry callback failed: {err:#}");
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("dsn", &self.dsn())
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeviceConfig::new("/dev/ttyACM0");
        assert_eq!(config.dsn, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.timeout_ms, 1000);
        assert_eq!(config.keepalive_interval_ms, 100);
        assert_eq!(config.identify_backoff_ms, 50);
        assert_eq!(config.checksum, ChecksumPolicy::Crc32);
    }

    #[test]
    fn test_new_device_is_disconnected() {
        let device = Device::new(DeviceConfig::new("/dev/null"), Arc::new(NoCallbacks));
        assert_eq!(device.status(), DeviceStatus::Disconnected);
        assert!(device.id().is_none());
        assert_eq!(device.methods().len(), 6);
    }

    #[tokio::test]
    async fn test_control_before_startup() {
        let device = Device::new(DeviceConfig::new("/dev/null"), Arc::new(NoCallbacks));
        let err = device.control("tare", &[]).await.unwrap_err();
        assert!(matches!(err, DeviceError::NotOpen));

        let err = device.control("warp", &[]).await.unwrap_err();
        assert!(matches!(err, DeviceError::UnknownCommand(_)));
    }

    #[tokio::test]
    async fn test_teardown_without_startup() {
        let device = Device::new(DeviceConfig::new("/dev/null"), Arc::new(NoCallbacks));
        device.teardown().await;
        assert_eq!(device.status(), DeviceStatus::Disconnected);
    }
}
