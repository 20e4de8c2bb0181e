//! Test-session runner
//!
//! Glues a [`LuaScript`] to a [`Device`]: `OnConnect` when the bench is
//! identified, `Test` in its own task, `OnTelemetry` per sample and
//! `OnDisconnect` once `Test` is over.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::datalog::TelemetryLog;
use crate::device::{Connector, Device, DeviceCallbacks, DeviceConfig};
use crate::protocol::Telemetry;
use crate::script::{EntryPoint, LuaScript, ScriptError};
use crate::signal::{Cause, CancelSignal};

/// Runs one scripted test session
pub struct TestRunner {
    script: LuaScript,
    session: CancelSignal,
    log: Arc<Mutex<TelemetryLog>>,
    tasks: TaskTracker,
}

impl TestRunner {
    /// `session` ends the run when cancelled; accepted telemetry goes to `log`
    pub fn new(script: LuaScript, session: CancelSignal, log: Arc<Mutex<TelemetryLog>>) -> Self {
        Self {
            script,
            session,
            log,
            tasks: TaskTracker::new(),
        }
    }

    /// Session signal
    pub fn session(&self) -> &CancelSignal {
        &self.session
    }

    /// Run the session until it ends and report why it ended
    ///
    /// The device lives on its own signal so `OnDisconnect` can still drive
    /// the bench after the session was cancelled.
    pub async fn run(
        self: &Arc<Self>,
        config: DeviceConfig,
        connector: impl Connector + 'static,
    ) -> anyhow::Result<Cause> {
        let device = Device::with_connector(config, connector, self.clone());
        let binding = self.script.bind(Arc::new(device.clone()))?;

        let device_signal = CancelSignal::new();
        if let Err(err) = device.startup(&device_signal).await {
            self.session
                .cancel_with(anyhow::anyhow!("startup failed: {err}"));
        }

        self.session.cancelled().await;
        self.tasks.close();
        self.tasks.wait().await;

        device.teardown().await;
        binding.release();

        let cause = self.session.cause().unwrap_or(Cause::Cancelled);
        info!(dsn = %device.dsn(), %cause, "session ended");
        Ok(cause)
    }
}

/// End the session according to how an entry point returned
fn finish(session: &CancelSignal, entry: EntryPoint, result: Result<(), ScriptError>) {
    match result {
        Ok(()) | Err(ScriptError::Stopped) => {
            info!(%entry, "script finished");
            session.cancel();
        }
        Err(ScriptError::Cancelled) => {}
        Err(err) => {
            warn!(%entry, %err, "script failed");
            session.cancel_with(err);
        }
    }
}

#[async_trait]
impl DeviceCallbacks for TestRunner {
    async fn on_connect(&self, _device: &Device) -> anyhow::Result<()> {
        match self
            .script
            .execute(EntryPoint::OnConnect, &self.session, ())
            .await
        {
            Ok(()) => {}
            Err(ScriptError::Stopped) => {
                self.session.cancel();
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let script = self.script.clone();
        let session = self.session.clone();
        self.tasks.spawn(async move {
            let result = script.execute(EntryPoint::Test, &session, ()).await;

            if let Err(err) = script
                .execute(EntryPoint::OnDisconnect, &CancelSignal::new(), ())
                .await
            {
                if !err.is_stop() {
                    warn!(%err, "OnDisconnect failed");
                }
            }

            finish(&session, EntryPoint::Test, result);
        });

        Ok(())
    }

    async fn on_telemetry(&self, _device: &Device, telemetry: &Telemetry) -> anyhow::Result<()> {
        let result = self
            .script
            .execute(EntryPoint::OnTelemetry, &self.session, telemetry.clone())
            .await;

        if result.is_ok() {
            self.log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(telemetry.clone());
            return Ok(());
        }
        finish(&self.session, EntryPoint::OnTelemetry, result);
        Ok(())
    }

    async fn on_disconnect(&self, _device: &Device) -> anyhow::Result<()> {
        self.session
            .cancel_with(anyhow::anyhow!("device disconnected"));
        Ok(())
    }
}
