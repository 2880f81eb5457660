//! Remote initializer: the system-bus object installer UIs drive. Custom
//! channels require Polkit authorization; default channels do not. The
//! worker runs on a blocking thread with a cancellation token, and its
//! progress lines are replayed as `ProgressChanged` signals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use zbus::fdo;
use zbus::message::Header;
use zbus::names::BusName;
use zbus::object_server::SignalContext;
use zbus::zvariant::Value;

use waydroid_core::{Channels, Error, Paths};

use crate::initializer::{self, InitOptions};
use crate::CancelToken;

pub const OBJECT_PATH: &str = "/Initializer";
pub const POLKIT_ACTION: &str = "id.waydro.Initializer.Init";

const POLKIT_ALLOW_USER_INTERACTION: u32 = 1;

#[zbus::proxy(
    interface = "org.freedesktop.PolicyKit1.Authority",
    default_service = "org.freedesktop.PolicyKit1",
    default_path = "/org/freedesktop/PolicyKit1/Authority"
)]
trait PolkitAuthority {
    #[allow(clippy::type_complexity)]
    fn check_authorization(
        &self,
        subject: &(&str, HashMap<&str, Value<'_>>),
        action_id: &str,
        details: HashMap<&str, &str>,
        flags: u32,
        cancellation_id: &str,
    ) -> zbus::Result<(bool, bool, HashMap<String, String>)>;
}

async fn check_polkit(connection: &zbus::Connection, header: &Header<'_>) -> fdo::Result<()> {
    let sender = header
        .sender()
        .ok_or_else(|| fdo::Error::Failed("anonymous caller".into()))?;
    let authority = PolkitAuthorityProxy::new(connection).await?;

    let mut subject_details: HashMap<&str, Value<'_>> = HashMap::new();
    subject_details.insert("name", Value::from(sender.as_str()));
    let subject = ("system-bus-name", subject_details);

    let (authorized, _is_challenge, _details) = authority
        .check_authorization(
            &subject,
            POLKIT_ACTION,
            HashMap::new(),
            POLKIT_ALLOW_USER_INTERACTION,
            "",
        )
        .await?;
    if !authorized {
        return Err(fdo::Error::AccessDenied(
            Error::PolicyDenied(POLKIT_ACTION).to_string(),
        ));
    }
    Ok(())
}

#[derive(Default)]
struct WorkerState {
    cancel: Option<CancelToken>,
}

pub struct InitializerObject {
    paths: Paths,
    state: Arc<Mutex<WorkerState>>,
}

impl InitializerObject {
    pub fn new(paths: Paths) -> Self {
        Self { paths, state: Arc::new(Mutex::new(WorkerState::default())) }
    }
}

fn parse_params(params: &HashMap<String, String>) -> fdo::Result<InitOptions> {
    const KNOWN: &[&str] = &["system_channel", "vendor_channel", "system_type"];
    for key in params.keys() {
        if !KNOWN.contains(&key.as_str()) {
            return Err(fdo::Error::InvalidArgs(format!("unknown parameter {key}")));
        }
    }
    let pick = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();
    Ok(InitOptions {
        force: true,
        images_path: None,
        system_channel: pick("system_channel"),
        vendor_channel: pick("vendor_channel"),
        rom_type: None,
        system_type: pick("system_type"),
    })
}

/// Custom channels can point the host at arbitrary image servers, so only
/// the distribution defaults skip the Polkit prompt.
fn needs_authorization(options: &InitOptions) -> bool {
    let defaults = Channels::load();
    options
        .system_channel
        .as_ref()
        .is_some_and(|c| *c != defaults.system_channel)
        || options
            .vendor_channel
            .as_ref()
            .is_some_and(|c| *c != defaults.vendor_channel)
}

#[zbus::interface(name = "id.waydro.Initializer")]
impl InitializerObject {
    async fn init(
        &self,
        params: HashMap<String, String>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
        #[zbus(signal_context)] ctxt: SignalContext<'_>,
    ) -> fdo::Result<()> {
        let options = parse_params(&params)?;
        if needs_authorization(&options) {
            check_polkit(connection, &header).await?;
        }

        let cancel = {
            let mut state = self.state.lock().unwrap();
            if state.cancel.is_some() {
                return Err(fdo::Error::Failed(
                    Error::AlreadyRunning("initializer").to_string(),
                ));
            }
            let token = CancelToken::new();
            state.cancel = Some(token.clone());
            token
        };

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let paths = self.paths.clone();
        let worker_cancel = cancel.clone();
        let worker = tokio::task::spawn_blocking(move || {
            let progress = move |line: &str| {
                let _ = progress_tx.send(line.to_string());
            };
            initializer::init(&paths, &options, &worker_cancel, Some(&progress))
        });

        // Replay worker progress as signals while it runs.
        let ctxt = ctxt.to_owned();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(line) = progress_rx.recv().await {
                if let Err(err) = InitializerObject::progress_changed(&ctxt, &line).await {
                    tracing::debug!("progress signal: {err}");
                }
            }
            let result = worker.await;
            state.lock().unwrap().cancel = None;
            match result {
                Ok(Ok(())) => {
                    let _ = InitializerObject::finished(&ctxt).await;
                }
                Ok(Err(err)) if cancel.is_cancelled() => {
                    tracing::info!("initialization interrupted: {err:#}");
                    let _ = InitializerObject::interrupted(&ctxt).await;
                }
                Ok(Err(err)) => {
                    tracing::error!("initialization failed: {err:#}");
                    let _ = InitializerObject::progress_changed(&ctxt, &format!("{err:#}")).await;
                    let _ = InitializerObject::interrupted(&ctxt).await;
                }
                Err(join_err) => {
                    tracing::error!("initializer worker panicked: {join_err}");
                    let _ = InitializerObject::interrupted(&ctxt).await;
                }
            }
        });
        Ok(())
    }

    /// Cancel a running initialization; the worker notices between
    /// downloads and between configuration steps.
    async fn cancel(&self) {
        if let Some(cancel) = &self.state.lock().unwrap().cancel {
            cancel.cancel();
        }
    }

    #[zbus(signal)]
    async fn progress_changed(ctxt: &SignalContext<'_>, line: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn finished(ctxt: &SignalContext<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn interrupted(ctxt: &SignalContext<'_>) -> zbus::Result<()>;
}

/// Export the initializer object on the container manager's connection.
pub async fn register(connection: &zbus::Connection, paths: Paths) -> Result<()> {
    connection
        .object_server()
        .at(OBJECT_PATH, InitializerObject::new(paths))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_params_are_rejected() {
        let mut params = HashMap::new();
        params.insert("system_channel".to_string(), "https://ota/custom".to_string());
        params.insert("exploit".to_string(), "x".to_string());
        assert!(parse_params(&params).is_err());
    }

    #[test]
    fn default_channels_skip_polkit() {
        let defaults = Channels::load();
        let mut params = HashMap::new();
        params.insert("system_channel".to_string(), defaults.system_channel.clone());
        let options = parse_params(&params).unwrap();
        assert!(!needs_authorization(&options));

        let mut params = HashMap::new();
        params.insert(
            "system_channel".to_string(),
            "https://evil.example/system".to_string(),
        );
        let options = parse_params(&params).unwrap();
        assert!(needs_authorization(&options));
    }

    #[test]
    fn empty_params_mean_defaults_and_no_prompt() {
        let options = parse_params(&HashMap::new()).unwrap();
        assert!(options.force);
        assert!(options.system_channel.is_none());
        assert!(!needs_authorization(&options));
    }
}
