//! Engine lifecycle: `Unconfigured -> Configured -> Running -> Stopped`.
//!
//! The engine owns the network stack handle and the dialer it feeds. Setup
//! runs in a fixed order (`general`, then `netstack`); teardown runs the
//! `pre_down` hook, closes the stack, waits for it, and shuts down every
//! forwarding session.

use crate::dialer::{DialOptions, TunnelDialer};
use crate::error::{LinkError, LinkResult};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Driver used when a device is given without a `driver://` prefix.
pub const DEFAULT_DRIVER: &str = "redirect";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unconfigured,
    Configured,
    Running,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineState::Unconfigured => "unconfigured",
            EngineState::Configured => "configured",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
        })
    }
}

/// Shell commands run around stack setup and teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hooks {
    pub pre_up: Option<String>,
    pub post_up: Option<String>,
    pub pre_down: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// `driver://name`, or a bare name for the default driver.
    pub device: String,
    pub dial: DialOptions,
    pub hooks: Hooks,
}

/// A parsed device string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub driver: String,
    pub name: String,
}

impl DeviceSpec {
    pub fn parse(device: &str) -> LinkResult<Self> {
        let device = device.trim();
        if device.is_empty() {
            return Err(LinkError::Config("empty device".into()));
        }
        let (driver, name) = match device.split_once("://") {
            Some((driver, name)) => (driver.to_ascii_lowercase(), name),
            None => (DEFAULT_DRIVER.to_string(), device),
        };
        if driver.is_empty() || name.is_empty() {
            return Err(LinkError::Config(format!("invalid device {device:?}")));
        }
        Ok(Self {
            driver,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.driver, self.name)
    }
}

/// A running network stack feeding connections into the dialer.
#[async_trait]
pub trait NetStack: Send {
    fn describe(&self) -> String;

    /// Stop accepting new flows. Must not block.
    fn close(&mut self);

    /// Wait until the stack has fully stopped.
    async fn wait(&mut self);
}

#[async_trait]
pub trait StackBuilder: Send + Sync {
    /// The device driver this builder handles.
    fn driver(&self) -> &str;

    async fn build(
        &self,
        device: &DeviceSpec,
        dialer: Arc<TunnelDialer>,
    ) -> LinkResult<Box<dyn NetStack>>;
}

struct EngineInner {
    state: EngineState,
    config: Option<EngineConfig>,
    stack: Option<Box<dyn NetStack>>,
}

pub struct Engine {
    dialer: Arc<TunnelDialer>,
    builder: Arc<dyn StackBuilder>,
    inner: Mutex<EngineInner>,
}

impl Engine {
    pub fn new(dialer: Arc<TunnelDialer>, builder: Arc<dyn StackBuilder>) -> Self {
        Self {
            dialer,
            builder,
            inner: Mutex::new(EngineInner {
                state: EngineState::Unconfigured,
                config: None,
                stack: None,
            }),
        }
    }

    pub fn dialer(&self) -> &Arc<TunnelDialer> {
        &self.dialer
    }

    pub async fn state(&self) -> EngineState {
        self.inner.lock().await.state
    }

    /// Store `config` for the next [`Engine::start`].
    pub async fn insert(&self, config: EngineConfig) -> LinkResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == EngineState::Running {
            return Err(LinkError::InvalidState {
                expected: "not running".into(),
                actual: inner.state.to_string(),
            });
        }
        debug!(device = %config.device, "engine configured");
        inner.config = Some(config);
        inner.state = EngineState::Configured;
        Ok(())
    }

    pub async fn start(&self) -> LinkResult<()> {
        let mut inner = self.inner.lock().await;
        let config = match (&inner.state, &inner.config) {
            (EngineState::Configured, Some(config)) => config.clone(),
            (state, _) => {
                return Err(LinkError::InvalidState {
                    expected: EngineState::Configured.to_string(),
                    actual: state.to_string(),
                })
            }
        };

        self.general(&config)?;
        let stack = self.netstack(&config).await?;
        info!(stack = %stack.describe(), "engine running");
        inner.stack = Some(stack);
        inner.state = EngineState::Running;
        Ok(())
    }

    /// Tear down the stack and all sessions. A no-op on a never-started engine.
    pub async fn stop(&self) -> LinkResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == EngineState::Running {
            if let Some(cmd) = inner.config.as_ref().and_then(|c| c.hooks.pre_down.clone()) {
                if let Err(e) = run_hook("pre_down", &cmd).await {
                    warn!(error = %e, "pre_down hook failed");
                }
            }
        }
        if let Some(mut stack) = inner.stack.take() {
            let describe = stack.describe();
            stack.close();
            stack.wait().await;
            info!(stack = %describe, "stack stopped");
        }
        self.dialer.registry().shutdown().await;
        inner.state = EngineState::Stopped;
        Ok(())
    }

    fn general(&self, config: &EngineConfig) -> LinkResult<()> {
        self.dialer.set_options(config.dial)?;
        debug!(
            keepalive = ?config.dial.keepalive,
            connect_timeout = ?config.dial.connect_timeout,
            "dialer options applied"
        );
        Ok(())
    }

    async fn netstack(&self, config: &EngineConfig) -> LinkResult<Box<dyn NetStack>> {
        if config.device.trim().is_empty() {
            return Err(LinkError::Config("device is required".into()));
        }

        if let Some(cmd) = &config.hooks.pre_up {
            if let Err(e) = run_hook("pre_up", cmd).await {
                warn!(error = %e, "pre_up hook failed");
            }
        }

        let device = DeviceSpec::parse(&config.device)?;
        if device.driver != self.builder.driver() {
            return Err(LinkError::Config(format!(
                "unsupported driver {:?}, expected {:?}",
                device.driver,
                self.builder.driver()
            )));
        }
        let stack = self.builder.build(&device, self.dialer.clone()).await?;

        if let Some(cmd) = &config.hooks.post_up {
            if let Err(e) = run_hook("post_up", cmd).await {
                warn!(error = %e, "post_up hook failed");
            }
        }
        Ok(stack)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(stack) = self.inner.get_mut().stack.as_mut() {
            stack.close();
        }
    }
}

/// Run `command` through `sh -c`; a non-zero exit is an error.
pub async fn run_hook(hook: &str, command: &str) -> LinkResult<()> {
    debug!(hook, command, "running hook");
    let output = Command::new("sh").arg("-c").arg(command).output().await?;
    if output.status.success() {
        return Ok(());
    }
    Err(LinkError::Hook {
        hook: hook.to_string(),
        message: format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    })
}
