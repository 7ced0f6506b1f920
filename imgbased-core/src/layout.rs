//! Bases and layers as they exist in the tagged volume group.

use anyhow::{bail, Context as _, Result};

use crate::{
    error::Error,
    fs::{mkfs::FsKind, mount::findmnt_source, remove_path},
    gc,
    hooks::Event,
    imgbase::Imgbase,
    lvm::{LogicalVolume, VolumeGroup, TAG_BASE, TAG_LAYER, TAG_POOL, TAG_VG},
    naming::{Base, Image, Layer, LayoutTree, Nvr},
};

pub struct Layout<'a> {
    imgbase: &'a Imgbase,
}

impl<'a> Layout<'a> {
    pub fn new(imgbase: &'a Imgbase) -> Self {
        Self { imgbase }
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(!self
            .imgbase
            .lvm()
            .list_vgs(Some(TAG_VG))
            .await?
            .is_empty())
    }

    pub async fn vg(&self) -> Result<VolumeGroup> {
        self.imgbase.lvm().vg_by_tag(TAG_VG).await
    }

    pub async fn pool(&self) -> Result<LogicalVolume> {
        self.imgbase.lvm().lv_by_tag(TAG_POOL).await
    }

    /// The volume backing an image of this layout.
    pub async fn lv_of(&self, image: &impl ToString) -> Result<LogicalVolume> {
        Ok(LogicalVolume::new(self.vg().await?.name, image.to_string()))
    }

    pub async fn tree(&self) -> Result<LayoutTree> {
        let vg = self.vg().await?;
        let names = self
            .imgbase
            .lvm()
            .list_lvs(None)
            .await?
            .into_iter()
            .filter(|lv| lv.vg == vg.name)
            .map(|lv| lv.name);
        LayoutTree::from_names(names)
    }

    pub async fn bases(&self) -> Result<Vec<Base>> {
        Ok(self.tree().await?.bases().to_vec())
    }

    pub async fn layers(&self) -> Result<Vec<Layer>> {
        Ok(self.tree().await?.layers())
    }

    /// The volume mounted as the running root.
    pub async fn current_lv(&self) -> Result<LogicalVolume> {
        let runner = self.imgbase.runner();
        let source = findmnt_source(runner, &self.imgbase.paths().root).await?;
        self.imgbase.lvm().from_path(source).await
    }

    pub async fn current_layer(&self) -> Result<Layer> {
        let lv = self.current_lv().await?;
        let vg = self.vg().await?;
        if lv.vg != vg.name {
            bail!(Error::NoValidLayout(format!(
                "the running root {lv} is outside of the layout volume group {vg}"
            )));
        }
        lv.name.parse::<Layer>().map_err(|_| {
            Error::NoValidLayout(format!("the running root {lv} is not a layer")).into()
        })
    }

    pub async fn latest_base(&self) -> Result<Base> {
        Ok(self.tree().await?.last_base()?.clone())
    }

    pub async fn latest_layer(&self) -> Result<Layer> {
        self.tree().await?.last_layer()
    }

    pub async fn base_of_layer(&self, layer: &Layer) -> Result<Base> {
        let tree = self.tree().await?;
        tree.base(&layer.nvr)
            .filter(|base| base.layers.contains(layer))
            .cloned()
            .ok_or_else(|| Error::NoValidLayout(format!("{layer} is not part of the layout")).into())
    }

    /// Unused bytes in the thin pool.
    pub async fn free_space(&self) -> Result<u64> {
        let lvm = self.imgbase.lvm();
        let pool = self.pool().await?;
        let size = lvm.size_bytes(&pool).await?;
        let (data_percent, _) = lvm.pool_usage(&pool).await?;
        let free = size as f64 * (100.0 - data_percent).clamp(0.0, 100.0) / 100.0;
        Ok(free as u64)
    }

    /// Turn an existing thin volume into the first base of a new layout and derive its first
    /// layer.
    pub async fn init_from(&self, lv_spec: &str, nvr: &Nvr) -> Result<Layer> {
        if self.exists().await? {
            let vg = self.vg().await?;
            bail!(Error::NoValidLayout(format!(
                "a layout already exists in volume group {vg}"
            )));
        }

        let lvm = self.imgbase.lvm();
        let existing = lvm.try_find(lv_spec).await?;
        let pool = lvm.thinpool(&existing).await?;
        let vg = VolumeGroup {
            name: existing.vg.clone(),
        };
        tracing::info!("Initializing layout from {existing} in pool {pool}");

        lvm.vg_add_tag(&vg, TAG_VG).await?;
        lvm.add_tag(&pool, TAG_POOL).await?;

        let base = Base::new(nvr.clone());
        let base_lv = lvm.rename(&existing, &base.lv_name()).await?;
        lvm.add_tag(&base_lv, TAG_BASE).await?;

        let layer = Layer::new(nvr.clone(), 1);
        let layer_lv = lvm.snapshot(&base_lv, &layer.lv_name()).await?;
        lvm.add_tag(&layer_lv, TAG_LAYER).await?;
        lvm.unprotect(&layer_lv).await?;
        lvm.protect(&base_lv).await?;

        let runner = self.imgbase.runner();
        let kind = FsKind::detect(runner, layer_lv.path()).await?;
        kind.randomize_uuid(runner, layer_lv.path()).await?;

        self.imgbase
            .emit(Event::NewBaseAdded {
                base: base.to_string(),
            })
            .await?;
        self.imgbase
            .emit(Event::NewLayerAdded {
                previous: base.to_string(),
                layer: layer.to_string(),
            })
            .await?;
        Ok(layer)
    }

    /// Create an empty, protected base volume.
    pub async fn add_base(&self, nvr: &Nvr, size_bytes: u64) -> Result<LogicalVolume> {
        let tree = self.tree().await?;
        if tree.base(nvr).is_some() {
            bail!(Error::NoValidLayout(format!("base {nvr} already exists")));
        }

        let lvm = self.imgbase.lvm();
        let pool = self.pool().await?;
        tracing::info!("Adding base {nvr} of {size_bytes} bytes");
        let lv = lvm.create_thin(&pool, &nvr.to_string(), size_bytes).await?;
        let finished = async {
            lvm.add_tag(&lv, TAG_BASE).await?;
            lvm.protect(&lv).await?;
            self.imgbase
                .emit(Event::NewBaseAdded {
                    base: nvr.to_string(),
                })
                .await
        };
        match finished.await {
            Ok(()) => Ok(lv),
            Err(error) => Err(self.discard(&lv, error).await),
        }
    }

    /// Remove `lv` again when setting it up after its creation failed. Returns `error`.
    async fn discard(&self, lv: &LogicalVolume, error: anyhow::Error) -> anyhow::Error {
        tracing::warn!("Removing {lv} again: {error:#}");
        if let Err(remove_error) = self.imgbase.lvm().remove(lv).await {
            tracing::error!("Failed to remove {lv}, LVM has to reclaim it: {remove_error:#}");
        }
        error
    }

    /// Add a layer on top of `target`, or on top of the latest layer when no target is given.
    pub async fn add_layer(&self, target: Option<&Image>) -> Result<Layer> {
        let tree = self.tree().await?;

        let previous = match target {
            Some(image) => {
                let known = match image {
                    Image::Base(base) => tree.base(&base.nvr).is_some(),
                    Image::Layer(layer) => tree.contains_layer(layer),
                };
                if !known {
                    bail!(Error::NoValidLayout(format!("{image} is not part of the layout")));
                }
                image.clone()
            }
            None => {
                let current = self.current_layer().await?;
                let latest = tree.last_base()?;
                if latest.nvr != current.nvr {
                    bail!(Error::LayerOutOfOrder(format!(
                        "the latest base {latest} is not the base of the current layer {current}"
                    )));
                }
                match latest.latest_layer() {
                    Some(layer) => Image::Layer(layer.clone()),
                    None => Image::Base(latest.clone()),
                }
            }
        };

        let layer = tree.suggest_next_layer(&previous);
        if tree.contains_layer(&layer) {
            bail!(Error::LayerOutOfOrder(format!(
                "{layer} already exists, {previous} is not the latest image of its base"
            )));
        }
        self.create_layer(&previous, &layer).await?;
        Ok(layer)
    }

    /// Snapshot `previous` as `layer` and make it writable.
    pub async fn create_layer(&self, previous: &Image, layer: &Layer) -> Result<LogicalVolume> {
        let lvm = self.imgbase.lvm();
        let origin = self.lv_of(previous).await?;
        tracing::info!("Adding layer {layer} on top of {previous}");

        let lv = lvm.snapshot(&origin, &layer.lv_name()).await?;
        let finished = async {
            lvm.add_tag(&lv, TAG_LAYER).await?;
            lvm.unprotect(&lv).await?;
            self.imgbase
                .emit(Event::NewLayerAdded {
                    previous: previous.to_string(),
                    layer: layer.to_string(),
                })
                .await
        };
        match finished.await {
            Ok(()) => Ok(lv),
            Err(error) => Err(self.discard(&lv, error).await),
        }
    }

    /// Remove a layer, its boot entries and its kernels under `/boot`. The running layer is
    /// refused.
    pub async fn remove_layer(&self, layer: &Layer) -> Result<()> {
        if let Ok(current) = self.current_layer().await {
            if current == *layer {
                bail!("Refusing to remove the running layer {layer}");
            }
        }

        tracing::info!("Removing layer {layer}");
        self.imgbase
            .bootloader()
            .remove_entries_of(layer)
            .await
            .with_context(|| format!("Failed to remove the boot entries of {layer}"))?;
        let lv = self.lv_of(layer).await?;
        self.imgbase.lvm().remove(&lv).await?;
        remove_path(
            self.imgbase.runner(),
            self.imgbase.paths().boot.join(layer.to_string()),
        )
        .await?;

        self.imgbase
            .emit(Event::LayerRemoved {
                layer: layer.to_string(),
            })
            .await
    }

    pub async fn remove_base(&self, nvr: &Nvr) -> Result<()> {
        let tree = self.tree().await?;
        let base = tree
            .base(nvr)
            .ok_or_else(|| Error::NoValidLayout(format!("base {nvr} does not exist")))?;
        gc::free_base(self.imgbase, base).await
    }
}
