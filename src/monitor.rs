// src/monitor.rs — EventMonitor: reconciles in-memory state with container-die events (spec §4.5)

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{info, warn};

use crate::artifact::ArtifactSink;
use crate::engine::{parse_container_name, ContainerEngine};
use crate::lifecycle::{KernelLifecycle, NvidiaHelper};
use crate::stats::StatsProbe;
use crate::upstream::UpstreamSink;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Runs forever, re-subscribing to the engine's event stream whenever it
/// terminates (transport failure or inactivity) — spec §4.5.
pub async fn run<E, A, S, U, N>(lifecycle: Arc<KernelLifecycle<E, A, S, U, N>>)
where
    E: ContainerEngine + 'static,
    A: ArtifactSink + 'static,
    S: StatsProbe + 'static,
    U: UpstreamSink + 'static,
    N: NvidiaHelper + 'static,
{
    loop {
        let mut stream = lifecycle.engine().events();
        info!("event monitor subscribed to engine event stream");

        while let Some(event) = stream.next().await {
            if event.action != "die" {
                continue;
            }
            let Some(name) = event.container_name else {
                continue;
            };
            let Some((_, id)) = parse_container_name(&name) else {
                continue;
            };
            // Fire-and-forget: a slow Clean for one kernel must not hold up
            // die-event processing for every other kernel on the stream.
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                lifecycle.clean(id).await;
            });
        }

        warn!("engine event stream ended, reconnecting");
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{container_name, EngineEvent};
    use crate::id::KernelId;

    #[test]
    fn die_event_resolves_to_kernel_id() {
        let id = KernelId::generate();
        let name = container_name("python3", id);
        let event = EngineEvent { action: "die".to_string(), container_name: Some(name) };
        let (lang, parsed) = parse_container_name(&event.container_name.unwrap()).unwrap();
        assert_eq!(lang, "python3");
        assert_eq!(parsed, id);
    }

    #[test]
    fn non_die_actions_and_unknown_names_are_ignored_by_the_filter() {
        let event = EngineEvent { action: "start".to_string(), container_name: Some("kernel.python3.deadbeef".into()) };
        assert_ne!(event.action, "die");

        let unknown = EngineEvent { action: "die".to_string(), container_name: Some("some-other-container".into()) };
        assert!(parse_container_name(&unknown.container_name.unwrap()).is_none());
    }
}
