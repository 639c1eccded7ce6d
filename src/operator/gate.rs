use futures::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::client::{AppEvent, ClusterClient};
use crate::controller::Error;
use crate::crd::Phase;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

fn timeout_error(name: &str, namespace: &str, after: Duration) -> Error {
    Error::Timeout {
        kind: "App".into(),
        namespace: namespace.into(),
        name: name.into(),
        after,
    }
}

/// Polls the installation until the in-cluster controller has reported on
/// the current generation, then maps its terminal condition to a result.
/// Read failures are retried until the timeout.
pub async fn await_success<C: ClusterClient + ?Sized>(
    client: &C,
    name: &str,
    namespace: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), Error> {
    let start = Instant::now();
    let mut last_phase: Option<Phase> = None;

    loop {
        match client.get_app(namespace, name).await {
            Ok(Some(app)) if app.status_is_current() => {
                let phase = Phase::of(&app);
                if last_phase != Some(phase) {
                    if phase.is_terminal() {
                        info!("{}", phase.message(&app));
                    } else {
                        debug!("{}", phase.message(&app));
                    }
                    last_phase = Some(phase);
                }
                match phase {
                    Phase::Succeeded => return Ok(()),
                    Phase::Failed => {
                        let status = app.status.unwrap_or_default();
                        let message = format!(
                            "{}: {}",
                            status.friendly_description.unwrap_or_default(),
                            status.useful_error_message.unwrap_or_default()
                        );
                        return Err(Error::ReconcileFailed {
                            name: name.into(),
                            message,
                        });
                    }
                    _ => {}
                }
            }
            Ok(Some(_)) => debug!("Status of {} does not reflect the latest change yet", name),
            Ok(None) => debug!("Installation {} not visible yet", name),
            Err(e) => warn!("Unable to read installation {}: {}", name, e),
        }

        if start.elapsed() >= timeout {
            return Err(timeout_error(name, namespace, timeout));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Watches installations carrying `label_selector` until the named one is
/// gone. A listing that no longer contains it counts as deleted, so a
/// deletion that finished before the watch started is not missed.
pub async fn await_deletion<C: ClusterClient + ?Sized>(
    client: &C,
    name: &str,
    namespace: &str,
    label_selector: &str,
    timeout: Duration,
) -> Result<(), Error> {
    let mut events = client.watch_apps(namespace, label_selector).await?;

    let wait = async {
        while let Some(event) = events.next().await {
            match event {
                Ok(AppEvent::Deleted(app)) if app.metadata.name.as_deref() == Some(name) => {
                    info!("{}", Phase::Deleted.message(&app));
                    return true;
                }
                Ok(AppEvent::Listed(apps))
                    if !apps.iter().any(|a| a.metadata.name.as_deref() == Some(name)) =>
                {
                    info!("Installation {} deleted", name);
                    return true;
                }
                Ok(AppEvent::Applied(app)) if app.metadata.name.as_deref() == Some(name) => {
                    debug!("{}", Phase::of(&app).message(&app));
                }
                Ok(_) => {}
                Err(e) => warn!("Watch of {} reported an error: {}", name, e),
            }
        }
        false
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::WatchClosed { name: name.into() }),
        Err(_) => Err(timeout_error(name, namespace, timeout)),
    }
}
