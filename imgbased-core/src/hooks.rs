//! Named events with a fixed argument shape.
//!
//! Built-in events are the variants of [`Event`]; further names can be registered at runtime with
//! [`Hooks::create`]. Subscribers declare how many arguments they take and are rejected at
//! connect time when that does not match the registered shape.

use std::{future::Future, path::PathBuf, sync::Arc};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use indexmap::IndexMap;

use crate::{
    error::Error,
    runner::{Invocation, Runner},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    NewBaseAdded { base: String },
    NewLayerAdded { previous: String, layer: String },
    PreBaseRemoved { base: String },
    BaseRemoved { base: String },
    LayerRemoved { layer: String },
    OsUpgraded { previous_lv: String, new_lv: String },
    VolumeCreated { path: String },
    VolumeRemoved { path: String },
    /// An event registered at runtime.
    Custom { name: String, args: Vec<String> },
}

/// Names and argument labels of the built-in events.
const BUILTIN: &[(&str, &[&str])] = &[
    ("new-base-added", &["base"]),
    ("new-layer-added", &["previous", "layer"]),
    ("pre-base-removed", &["base"]),
    ("base-removed", &["base"]),
    ("layer-removed", &["layer"]),
    ("os-upgraded", &["previous_lv", "new_lv"]),
    ("volume-created", &["path"]),
    ("volume-removed", &["path"]),
];

impl Event {
    pub fn name(&self) -> &str {
        match self {
            Event::NewBaseAdded { .. } => "new-base-added",
            Event::NewLayerAdded { .. } => "new-layer-added",
            Event::PreBaseRemoved { .. } => "pre-base-removed",
            Event::BaseRemoved { .. } => "base-removed",
            Event::LayerRemoved { .. } => "layer-removed",
            Event::OsUpgraded { .. } => "os-upgraded",
            Event::VolumeCreated { .. } => "volume-created",
            Event::VolumeRemoved { .. } => "volume-removed",
            Event::Custom { name, .. } => name,
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            Event::NewBaseAdded { base }
            | Event::PreBaseRemoved { base }
            | Event::BaseRemoved { base } => vec![base.clone()],
            Event::LayerRemoved { layer } => vec![layer.clone()],
            Event::NewLayerAdded { previous, layer } => vec![previous.clone(), layer.clone()],
            Event::OsUpgraded {
                previous_lv,
                new_lv,
            } => vec![previous_lv.clone(), new_lv.clone()],
            Event::VolumeCreated { path } | Event::VolumeRemoved { path } => vec![path.clone()],
            Event::Custom { args, .. } => args.clone(),
        }
    }
}

/// Receives the arguments of one named event.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn arity(&self) -> usize;

    async fn call(&self, args: &[String]) -> Result<()>;
}

/// Receives every event.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &Event) -> Result<()>;
}

struct FnSubscriber<F> {
    arity: usize,
    f: F,
}

#[async_trait]
impl<F, Fut> Subscriber for FnSubscriber<F>
where
    F: Fn(Vec<String>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn arity(&self) -> usize {
        self.arity
    }

    async fn call(&self, args: &[String]) -> Result<()> {
        (self.f)(args.to_vec()).await
    }
}

/// Wrap a closure taking `arity` arguments as a subscriber.
pub fn handler<F, Fut>(arity: usize, f: F) -> Arc<dyn Subscriber>
where
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnSubscriber { arity, f })
}

pub struct Hooks {
    specs: IndexMap<String, Vec<String>>,
    subscribers: IndexMap<String, Vec<Arc<dyn Subscriber>>>,
    listeners: Vec<Arc<dyn EventListener>>,
}

impl Default for Hooks {
    fn default() -> Self {
        let mut hooks = Self {
            specs: IndexMap::new(),
            subscribers: IndexMap::new(),
            listeners: vec![],
        };
        for (name, argspec) in BUILTIN {
            hooks
                .specs
                .insert(name.to_string(), argspec.iter().map(|a| a.to_string()).collect());
        }
        hooks
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` with the labels of its arguments.
    pub fn create(&mut self, name: &str, argspec: &[&str]) -> Result<()> {
        let argspec = argspec.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        match self.specs.get(name) {
            Some(existing) if existing.len() != argspec.len() => bail!(Error::ArityMismatch {
                name: name.to_owned(),
                expected: existing.len(),
                got: argspec.len(),
            }),
            Some(_) => {}
            None => {
                self.specs.insert(name.to_owned(), argspec);
            }
        }
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    fn expected_arity(&self, name: &str) -> Result<usize> {
        self.specs
            .get(name)
            .map(Vec::len)
            .ok_or_else(|| Error::UnknownHook(name.to_owned()).into())
    }

    pub fn connect(&mut self, name: &str, subscriber: Arc<dyn Subscriber>) -> Result<()> {
        let expected = self.expected_arity(name)?;
        if subscriber.arity() != expected {
            bail!(Error::ArityMismatch {
                name: name.to_owned(),
                expected,
                got: subscriber.arity(),
            });
        }
        self.subscribers
            .entry(name.to_owned())
            .or_default()
            .push(subscriber);
        Ok(())
    }

    pub fn connect_any(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    /// Deliver `event` to the subscribers of its name and to every listener. The first failure
    /// is returned to the caller.
    pub async fn emit(&self, event: &Event) -> Result<()> {
        let name = event.name();
        let args = event.args();
        let expected = self.expected_arity(name)?;
        if args.len() != expected {
            bail!(Error::ArityMismatch {
                name: name.to_owned(),
                expected,
                got: args.len(),
            });
        }

        tracing::debug!("Emitting {name} {args:?}");
        for subscriber in self.subscribers.get(name).into_iter().flatten() {
            subscriber
                .call(&args)
                .await
                .with_context(|| format!("Subscriber of {name} failed"))?;
        }
        for listener in &self.listeners {
            listener
                .on_event(event)
                .await
                .with_context(|| format!("Listener failed on {name}"))?;
        }
        Ok(())
    }
}

/// Runs every file in a directory as `<script> <name> <args…>` for each event.
pub struct ScriptListener {
    runner: Runner,
    dir: PathBuf,
}

impl ScriptListener {
    pub fn new(runner: &Runner, dir: impl Into<PathBuf>) -> Self {
        Self {
            runner: runner.clone(),
            dir: dir.into(),
        }
    }

    async fn scripts(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(vec![]);
        }
        let mut scripts = vec![];
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list hooks in {:?}", self.dir))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() {
                scripts.push(path);
            }
        }
        scripts.sort();
        Ok(scripts)
    }
}

#[async_trait]
impl EventListener for ScriptListener {
    async fn on_event(&self, event: &Event) -> Result<()> {
        for script in self.scripts().await? {
            tracing::debug!("Running hook {script:?} for {}", event.name());
            self.runner
                .run(Invocation::new(&script).arg(event.name()).args(event.args()))
                .await
                .with_context(|| format!("Hook script {script:?} failed"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::testutils::FakeHost;

    #[test]
    fn test_connect_unknown() {
        let mut hooks = Hooks::new();
        let error = hooks
            .connect("no-such-hook", handler(0, |_| async { Ok(()) }))
            .unwrap_err();
        assert!(matches!(Error::find(&error), Some(Error::UnknownHook(n)) if n == "no-such-hook"));
    }

    #[test]
    fn test_connect_arity_mismatch() {
        let mut hooks = Hooks::new();
        let error = hooks
            .connect("new-layer-added", handler(1, |_| async { Ok(()) }))
            .unwrap_err();
        assert!(matches!(
            Error::find(&error),
            Some(Error::ArityMismatch {
                expected: 2,
                got: 1,
                ..
            })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_emit_reaches_subscribers_and_listeners() -> Result<()> {
        struct Collect(Mutex<Vec<String>>);

        #[async_trait]
        impl EventListener for Collect {
            async fn on_event(&self, event: &Event) -> Result<()> {
                self.0.lock().unwrap().push(event.name().to_owned());
                Ok(())
            }
        }

        let mut hooks = Hooks::new();
        let seen = Arc::new(Mutex::new(vec![]));
        let seen_in_handler = seen.clone();
        hooks.connect(
            "os-upgraded",
            handler(2, move |args| {
                let seen = seen_in_handler.clone();
                async move {
                    seen.lock().unwrap().push(args.join(" "));
                    Ok(())
                }
            }),
        )?;
        let collect = Arc::new(Collect(Mutex::new(vec![])));
        hooks.connect_any(collect.clone());

        hooks
            .emit(&Event::OsUpgraded {
                previous_lv: "Image-1.0-0+1".into(),
                new_lv: "Image-2.0-0+1".into(),
            })
            .await?;
        hooks
            .emit(&Event::BaseRemoved {
                base: "Image-0.9-0".into(),
            })
            .await?;

        assert_eq!(*seen.lock().unwrap(), ["Image-1.0-0+1 Image-2.0-0+1"]);
        assert_eq!(*collect.0.lock().unwrap(), ["os-upgraded", "base-removed"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscriber_failure_propagates() -> Result<()> {
        let mut hooks = Hooks::new();
        hooks.create("pre-update", &["image"])?;
        hooks.connect(
            "pre-update",
            handler(1, |_| async { bail!("not today") }),
        )?;

        let error = hooks
            .emit(&Event::Custom {
                name: "pre-update".into(),
                args: vec!["x.squashfs.img".into()],
            })
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("not today"));

        let error = hooks
            .emit(&Event::Custom {
                name: "pre-update".into(),
                args: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(Error::find(&error), Some(Error::ArityMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_recreate_with_other_shape() -> Result<()> {
        let mut hooks = Hooks::new();
        hooks.create("post-check", &["result"])?;
        hooks.create("post-check", &["other-label"])?;
        assert!(hooks.create("post-check", &["a", "b"]).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_script_listener() -> Result<()> {
        let dir = tempfile::tempdir()?;
        tokio::fs::write(dir.path().join("20-second"), "").await?;
        tokio::fs::write(dir.path().join("10-first"), "").await?;

        let host = Arc::new(FakeHost::new());
        let runner = Runner::with_executor(host.clone(), false);
        let mut hooks = Hooks::new();
        hooks.connect_any(Arc::new(ScriptListener::new(&runner, dir.path())));

        hooks
            .emit(&Event::NewBaseAdded {
                base: "Image-2.0-0".into(),
            })
            .await?;

        let calls = host.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0][0].ends_with("10-first"));
        assert!(calls[1][0].ends_with("20-second"));
        assert_eq!(calls[0][1..], ["new-base-added", "Image-2.0-0"]);
        Ok(())
    }
}
