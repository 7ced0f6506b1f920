//! Finding and removing what failed updates left behind.

use anyhow::Result;

use crate::{
    gc,
    imgbase::Imgbase,
    naming::{Base, Layer},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Leftovers {
    /// Layers without a boot entry, other than the running one.
    pub layers: Vec<Layer>,
    /// Bases without layers, other than the running and the latest one.
    pub bases: Vec<Base>,
}

impl Leftovers {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty() && self.bases.is_empty()
    }
}

pub async fn find_leftovers(imgbase: &Imgbase) -> Result<Leftovers> {
    let layout = imgbase.layout();
    let tree = layout.tree().await?;
    let current = layout.current_layer().await.ok();
    let bootable = imgbase
        .bootloader()
        .entries()
        .await?
        .into_iter()
        .filter(|e| e.bootid.is_some())
        .filter_map(|e| e.layer)
        .collect::<Vec<_>>();

    let layers = tree
        .layers()
        .into_iter()
        .filter(|layer| Some(layer) != current.as_ref())
        .filter(|layer| !bootable.contains(&layer.to_string()))
        .collect();

    let latest = tree.bases().last().map(|base| base.nvr.clone());
    let bases = tree
        .bases()
        .iter()
        .filter(|base| base.layers.is_empty())
        .filter(|base| Some(&base.nvr) != latest.as_ref())
        .filter(|base| Some(&base.nvr) != current.as_ref().map(|layer| &layer.nvr))
        .cloned()
        .collect();

    Ok(Leftovers { layers, bases })
}

/// Remove the leftovers, layers first. Returns what was removed.
pub async fn recover(imgbase: &Imgbase) -> Result<Leftovers> {
    let leftovers = find_leftovers(imgbase).await?;
    if leftovers.is_empty() {
        tracing::info!("Nothing to recover");
        return Ok(leftovers);
    }

    let layout = imgbase.layout();
    for layer in leftovers.layers.iter().rev() {
        layout.remove_layer(layer).await?;
    }
    for base in &leftovers.bases {
        gc::free_base(imgbase, base).await?;
    }
    tracing::info!(
        "Removed {} layers and {} bases",
        leftovers.layers.len(),
        leftovers.bases.len()
    );
    Ok(leftovers)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::InMemoryConfigSource, imgbase::HostPaths, runner::Runner, testutils::FakeHost,
    };

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recover_leftovers() -> Result<()> {
        let host = Arc::new(FakeHost::with_thin_root("hostvg", "pool0", "root", 10 << 30));
        let dir = tempfile::tempdir()?;
        let paths = HostPaths::under(dir.path().join("host"));
        let root = paths.root.to_string_lossy().into_owned();
        host.set_static_mount(&root, "/dev/hostvg/root", "rw");
        let config = format!(
            "[bootloader]\nkind = bls\nentries = {}\n",
            dir.path().join("entries").display()
        );
        let imgbase = Imgbase::load(
            Runner::with_executor(host.clone(), false),
            &InMemoryConfigSource::new(config),
            paths,
        )
        .await?;
        let layout = imgbase.layout();

        let first = layout
            .init_from("hostvg/root", &"Image-1.0-0".parse()?)
            .await?;
        host.set_static_mount(&root, "/dev/hostvg/Image-1.0-0+1", "rw");
        // a failed update: base and layer without a boot entry
        layout.add_base(&"Image-2.0-0".parse()?, 1 << 30).await?;
        layout.add_layer(Some(&"Image-2.0-0".parse()?)).await?;
        // an orphaned base
        layout.add_base(&"Image-1.5-0".parse()?, 1 << 30).await?;

        let found = find_leftovers(&imgbase).await?;
        assert_eq!(
            found.layers.iter().map(ToString::to_string).collect::<Vec<_>>(),
            ["Image-2.0-0+1"]
        );
        assert_eq!(
            found.bases.iter().map(ToString::to_string).collect::<Vec<_>>(),
            ["Image-1.5-0"]
        );

        recover(&imgbase).await?;
        assert_eq!(
            host.lv_names("hostvg"),
            ["Image-1.0-0", "Image-1.0-0+1", "Image-2.0-0", "pool0"]
        );
        assert_eq!(layout.current_layer().await?, first);
        assert!(find_leftovers(&imgbase).await?.is_empty());
        Ok(())
    }
}
