use crate::Result;
use futures::{StreamExt, TryStreamExt};
use kube::runtime::watcher;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::{debug, info};

pub use kube::runtime::watcher::Event;

/// Watches one resource type and hands every event to a handler.
///
/// `watch` returns when the stream ends or fails; callers own reconnection.
pub struct ResourceWatcher<K> {
    api: Api<K>,
    config: watcher::Config,
    kind: &'static str,
}

impl<K> ResourceWatcher<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    pub fn new(api: Api<K>, kind: &'static str) -> Self {
        Self {
            api,
            config: watcher::Config::default(),
            kind,
        }
    }

    pub fn with_fields(mut self, field_selector: &str) -> Self {
        self.config = self.config.fields(field_selector);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub async fn watch<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(Event<K>),
    {
        info!("Starting {} watcher", self.kind);

        let mut stream = watcher(self.api.clone(), self.config.clone()).boxed();

        while let Some(event) = stream.try_next().await.map_err(|e| {
            crate::InterferoError::KubernetesError(format!("{} watch failed: {}", self.kind, e))
        })? {
            if let Event::InitDone = event {
                debug!("{} watcher initial list complete", self.kind);
            }
            handler(event);
        }

        Ok(())
    }
}
