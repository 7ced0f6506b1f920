//! Names of bases and layers, and the tree they form.
//!
//! A base is named after an NVR (`Image-1.0-0`), a layer after the NVR of its base plus an
//! index (`Image-1.0-0+1`).

use std::{cmp::Ordering, collections::BTreeMap, fmt::Display, str::FromStr};

use anyhow::{anyhow, bail, Result};

use crate::error::Error;

/// Name-Version-Release identifier. The name may contain hyphens, the last two hyphens
/// separate version and release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nvr {
    pub name: String,
    pub version: String,
    pub release: String,
}

impl FromStr for Nvr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.rsplitn(3, '-');
        let (Some(release), Some(version), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!(Error::InvalidName(s.to_owned()));
        };
        if name.is_empty() || version.is_empty() || release.is_empty() || s.contains('+') {
            bail!(Error::InvalidName(s.to_owned()));
        }
        Ok(Nvr {
            name: name.to_owned(),
            version: version.to_owned(),
            release: release.to_owned(),
        })
    }
}

impl Display for Nvr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.name, self.version, self.release)
    }
}

impl Ord for Nvr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| rpmvercmp(&self.version, &other.version))
            .then_with(|| rpmvercmp(&self.release, &other.release))
    }
}

impl PartialOrd for Nvr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Nvr {
    /// Compare two NVRs of the same stream. Different names do not compare.
    pub fn cmp_in_stream(&self, other: &Self) -> Option<Ordering> {
        (self.name == other.name).then(|| self.cmp(other))
    }
}

/// Package style version comparison, the same rules rpm applies to version and release.
pub fn rpmvercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    let is_sep = |c: &u8| !c.is_ascii_alphanumeric() && *c != b'~' && *c != b'^';

    loop {
        while a.first().is_some_and(is_sep) {
            a = &a[1..];
        }
        while b.first().is_some_and(is_sep) {
            b = &b[1..];
        }

        // tilde sorts before everything, even the end of the string
        match (a.first() == Some(&b'~'), b.first() == Some(&b'~')) {
            (true, true) => {
                a = &a[1..];
                b = &b[1..];
                continue;
            }
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }

        // caret sorts after the end of the string but before anything else
        match (a.first() == Some(&b'^'), b.first() == Some(&b'^')) {
            (true, true) => {
                a = &a[1..];
                b = &b[1..];
                continue;
            }
            (true, false) => {
                return if b.is_empty() {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, true) => {
                return if a.is_empty() {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            _ => {}
        }

        if a.is_empty() || b.is_empty() {
            break;
        }

        let numeric = a[0].is_ascii_digit();
        let take = |s: &[u8]| {
            s.iter()
                .take_while(|c| {
                    if numeric {
                        c.is_ascii_digit()
                    } else {
                        c.is_ascii_alphabetic()
                    }
                })
                .count()
        };
        let (la, lb) = (take(a), take(b));
        let (seg_a, seg_b) = (&a[..la], &b[..lb]);

        if seg_b.is_empty() {
            // numeric segments are newer than alpha ones
            return if numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let ord = if numeric {
            let trim = |s: &[u8]| {
                let zeros = s.iter().take_while(|c| **c == b'0').count();
                s[zeros..].to_vec()
            };
            let (na, nb) = (trim(seg_a), trim(seg_b));
            na.len().cmp(&nb.len()).then_with(|| na.cmp(&nb))
        } else {
            seg_a.cmp(seg_b)
        };
        if ord != Ordering::Equal {
            return ord;
        }

        a = &a[la..];
        b = &b[lb..];
    }

    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        _ => Ordering::Greater,
    }
}

/// A writable snapshot belonging to a base.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Layer {
    pub nvr: Nvr,
    pub index: u32,
}

impl Layer {
    pub fn new(nvr: Nvr, index: u32) -> Self {
        Self { nvr, index }
    }

    /// Name of the base this layer belongs to.
    pub fn base_name(&self) -> String {
        self.nvr.to_string()
    }

    pub fn lv_name(&self) -> String {
        self.to_string()
    }

    /// The image this layer was derived from: the layer with index one less, or the base.
    pub fn prev(&self) -> Image {
        if self.index <= 1 {
            Image::Base(Base::new(self.nvr.clone()))
        } else {
            Image::Layer(Layer::new(self.nvr.clone(), self.index - 1))
        }
    }
}

impl Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.nvr, self.index)
    }
}

impl FromStr for Layer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.parse::<Image>()? {
            Image::Layer(layer) => Ok(layer),
            Image::Base(_) => Err(anyhow!("{s:?} names a base, not a layer")),
        }
    }
}

impl Ord for Layer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nvr.cmp(&other.nvr).then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Layer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A read-only image holding a complete OS tree, with the layers derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base {
    pub nvr: Nvr,
    pub layers: Vec<Layer>,
}

impl Base {
    pub fn new(nvr: Nvr) -> Self {
        Self {
            nvr,
            layers: vec![],
        }
    }

    pub fn lv_name(&self) -> String {
        self.nvr.to_string()
    }

    pub fn latest_layer(&self) -> Option<&Layer> {
        self.layers.last()
    }
}

impl Display for Base {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.nvr.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Image {
    Base(Base),
    Layer(Layer),
}

impl Image {
    pub fn nvr(&self) -> &Nvr {
        match self {
            Image::Base(base) => &base.nvr,
            Image::Layer(layer) => &layer.nvr,
        }
    }

    /// Sort key, bases sort before their layers.
    fn sort_key(&self) -> (&Nvr, u32) {
        match self {
            Image::Base(base) => (&base.nvr, 0),
            Image::Layer(layer) => (&layer.nvr, layer.index),
        }
    }
}

impl FromStr for Image {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once('+') {
            Some((nvr, index)) => {
                let index = index
                    .parse::<u32>()
                    .ok()
                    .filter(|i| *i > 0 && index.bytes().all(|c| c.is_ascii_digit()))
                    .ok_or_else(|| Error::InvalidName(s.to_owned()))?;
                Ok(Image::Layer(Layer::new(nvr.parse()?, index)))
            }
            None => Ok(Image::Base(Base::new(s.parse()?))),
        }
    }
}

impl Display for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Image::Base(base) => base.fmt(f),
            Image::Layer(layer) => layer.fmt(f),
        }
    }
}

impl Ord for Image {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Image {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bases sorted by NVR, each holding its layers sorted by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutTree {
    bases: Vec<Base>,
}

impl LayoutTree {
    /// Build the tree from a flat list of volume names. Names which do not parse are ignored.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut images = names
            .into_iter()
            .filter_map(|name| {
                let name = name.as_ref();
                match name.parse::<Image>() {
                    Ok(image) => Some(image),
                    Err(_) => {
                        tracing::trace!("Ignoring volume {name:?}, not an image name");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        images.sort();
        images.dedup();

        let mut bases = BTreeMap::<Nvr, Base>::new();
        for image in images {
            match image {
                Image::Base(base) => {
                    bases.insert(base.nvr.clone(), base);
                }
                Image::Layer(layer) => match bases.get_mut(&layer.nvr) {
                    Some(base) => base.layers.push(layer),
                    None => {
                        tracing::warn!("Layer {layer} has no base, ignoring it");
                    }
                },
            }
        }

        if bases.is_empty() {
            bail!(Error::NoBases);
        }

        Ok(Self {
            bases: bases.into_values().collect(),
        })
    }

    pub fn bases(&self) -> &[Base] {
        &self.bases
    }

    pub fn base(&self, nvr: &Nvr) -> Option<&Base> {
        self.bases.iter().find(|b| &b.nvr == nvr)
    }

    pub fn layers(&self) -> Vec<Layer> {
        self.bases
            .iter()
            .flat_map(|base| base.layers.iter().cloned())
            .collect()
    }

    pub fn contains_layer(&self, layer: &Layer) -> bool {
        self.base(&layer.nvr)
            .is_some_and(|base| base.layers.contains(layer))
    }

    pub fn last_base(&self) -> Result<&Base> {
        self.bases.last().ok_or_else(|| Error::NoBases.into())
    }

    pub fn last_layer(&self) -> Result<Layer> {
        self.layers()
            .pop()
            .ok_or_else(|| Error::NoValidLayout("no layers found".into()).into())
    }

    /// The predecessor of `layer` across all bases.
    pub fn layer_before(&self, layer: &Layer) -> Result<Layer> {
        let layers = self.layers();
        let pos = layers
            .iter()
            .position(|l| l == layer)
            .ok_or_else(|| Error::NoValidLayout(format!("layer {layer} not found")))?;
        if pos == 0 {
            bail!(Error::NoValidLayout(format!(
                "layer {layer} is the oldest layer"
            )));
        }
        Ok(layers[pos - 1].clone())
    }

    /// The name the next layer derived from `image` would get.
    pub fn suggest_next_layer(&self, image: &Image) -> Layer {
        match image {
            Image::Base(base) => {
                let max = self
                    .base(&base.nvr)
                    .and_then(|b| b.layers.iter().map(|l| l.index).max())
                    .unwrap_or(0);
                Layer::new(base.nvr.clone(), max + 1)
            }
            Image::Layer(layer) => Layer::new(layer.nvr.clone(), layer.index + 1),
        }
    }
}
