//! An in-memory host for tests: simulates thin LVM, mounts, `findmnt`, `blkid` and `rpm`, and
//! records every invocation it sees.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use anyhow::Result;
use async_trait::async_trait;

use crate::runner::{CommandExecutor, Invocation, Output};

#[derive(Debug, Clone, PartialEq)]
pub struct FakeLv {
    pub vg: String,
    pub name: String,
    pub size: u64,
    pub pool: Option<String>,
    pub origin: Option<String>,
    pub tags: Vec<String>,
    pub is_pool: bool,
    pub writable: bool,
    pub active: bool,
    pub activation_skip: bool,
    pub data_percent: f64,
    pub metadata_percent: f64,
    pub metadata_size: u64,
}

impl FakeLv {
    fn attr(&self) -> String {
        format!(
            "{}{}i-{}-tz-{}",
            if self.is_pool {
                't'
            } else if self.pool.is_some() {
                'V'
            } else {
                '-'
            },
            if self.writable { 'w' } else { 'r' },
            if self.active { 'a' } else { '-' },
            if self.activation_skip { 'k' } else { '-' },
        )
    }
}

#[derive(Debug, Clone)]
struct FakeVg {
    tags: Vec<String>,
    free: u64,
}

#[derive(Debug, Clone)]
struct FakePackage {
    nvra: String,
    name: String,
    provides: Vec<String>,
    files: Vec<String>,
    scripts: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    vgs: HashMap<String, FakeVg>,
    lvs: Vec<FakeLv>,
    /// `(source, target)` of active mounts, in mount order.
    mounts: Vec<(String, PathBuf)>,
    /// Mounts which exist outside of this process, such as `/`.
    static_mounts: HashMap<PathBuf, (String, String)>,
    fs_types: HashMap<String, String>,
    packages: Vec<FakePackage>,
    fixtures: Vec<(String, PathBuf)>,
    failures: Vec<String>,
    calls: Vec<Vec<String>>,
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

fn ok(stdout: impl Into<String>) -> Result<Output> {
    Ok(Output::success(stdout.into().into_bytes()))
}

fn fail(code: i32, stderr: impl Into<String>) -> Result<Output> {
    Ok(Output::failure(code, stderr.into().into_bytes()))
}

/// `vg/lv`, `/dev/vg/lv` or `/dev/mapper/vg-lv` into `(vg, lv)`.
fn split_target(target: &str) -> Option<(String, String)> {
    if let Some(mapper) = target.strip_prefix("/dev/mapper/") {
        let mut parts = vec![String::new()];
        let mut chars = mapper.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    parts.last_mut()?.push('-');
                }
                '-' => parts.push(String::new()),
                c => parts.last_mut()?.push(c),
            }
        }
        return match parts.as_slice() {
            [vg, lv] => Some((vg.clone(), lv.clone())),
            _ => None,
        };
    }
    let spec = target.strip_prefix("/dev/").unwrap_or(target);
    let (vg, lv) = spec.split_once('/')?;
    Some((vg.to_owned(), lv.to_owned()))
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A volume group with a thin pool and one thin volume mounted on `/`.
    pub fn with_thin_root(vg: &str, pool: &str, lv: &str, size: u64) -> Self {
        let host = Self::new();
        {
            let mut state = host.state();
            state.vgs.insert(
                vg.to_owned(),
                FakeVg {
                    tags: vec![],
                    free: 1 << 30,
                },
            );
            state.lvs.push(FakeLv {
                vg: vg.to_owned(),
                name: pool.to_owned(),
                size: 100 << 30,
                pool: None,
                origin: None,
                tags: vec![],
                is_pool: true,
                writable: true,
                active: true,
                activation_skip: false,
                data_percent: 12.5,
                metadata_percent: 4.0,
                metadata_size: 1 << 30,
            });
            state.lvs.push(FakeLv {
                vg: vg.to_owned(),
                name: lv.to_owned(),
                size,
                pool: Some(pool.to_owned()),
                origin: None,
                tags: vec![],
                is_pool: false,
                writable: true,
                active: true,
                activation_skip: false,
                data_percent: 0.0,
                metadata_percent: 0.0,
                metadata_size: 0,
            });
            state.static_mounts.insert(
                PathBuf::from("/"),
                (format!("/dev/{vg}/{lv}"), "rw,relatime,discard".to_owned()),
            );
        }
        host
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every invocation seen so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state().calls.clone()
    }

    pub fn calls_of(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| argv[0] == program)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn lv(&self, vg: &str, name: &str) -> Option<FakeLv> {
        self.state()
            .lvs
            .iter()
            .find(|lv| lv.vg == vg && lv.name == name)
            .cloned()
    }

    pub fn lv_names(&self, vg: &str) -> Vec<String> {
        let mut names = self
            .state()
            .lvs
            .iter()
            .filter(|lv| lv.vg == vg)
            .map(|lv| lv.name.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn vg_tags(&self, vg: &str) -> Vec<String> {
        self.state()
            .vgs
            .get(vg)
            .map(|v| v.tags.clone())
            .unwrap_or_default()
    }

    pub fn set_pool_usage(&self, vg: &str, pool: &str, data: f64, metadata: f64, metadata_size: u64) {
        if let Some(lv) = self
            .state()
            .lvs
            .iter_mut()
            .find(|lv| lv.vg == vg && lv.name == pool)
        {
            lv.data_percent = data;
            lv.metadata_percent = metadata;
            lv.metadata_size = metadata_size;
        }
    }

    /// Pretend `/` is now mounted from `source`, as after a reboot.
    pub fn set_root(&self, source: &str) {
        self.set_static_mount("/", source, "rw,relatime,discard");
    }

    pub fn set_static_mount(&self, target: &str, source: &str, options: &str) {
        self.state().static_mounts.insert(
            PathBuf::from(target),
            (source.to_owned(), options.to_owned()),
        );
    }

    pub fn set_fs_type(&self, device: &str, kind: &str) {
        self.state()
            .fs_types
            .insert(device.to_owned(), kind.to_owned());
    }

    /// Populate the target of every mount whose source ends with `source_suffix` with a copy of
    /// `dir`.
    pub fn add_mount_fixture(&self, source_suffix: &str, dir: impl AsRef<Path>) {
        self.state()
            .fixtures
            .push((source_suffix.to_owned(), dir.as_ref().to_path_buf()));
    }

    /// Make every invocation whose command line contains `pattern` exit with status 1.
    pub fn fail_on(&self, pattern: &str) {
        self.state().failures.push(pattern.to_owned());
    }

    pub fn add_package(&self, nvra: &str, provides: &[&str], files: &[&str]) {
        let name = nvra
            .parse::<crate::naming::Nvr>()
            .map(|nvr| nvr.name)
            .unwrap_or_else(|_| nvra.to_owned());
        self.state().packages.push(FakePackage {
            nvra: nvra.to_owned(),
            name,
            provides: provides.iter().map(|s| s.to_string()).collect(),
            files: files.iter().map(|s| s.to_string()).collect(),
            scripts: HashMap::new(),
        });
    }

    pub fn set_package_script(&self, package: &str, tag: &str, body: &str) {
        if let Some(p) = self
            .state()
            .packages
            .iter_mut()
            .find(|p| p.name == package || p.nvra == package)
        {
            p.scripts.insert(tag.to_owned(), body.to_owned());
        }
    }

    pub fn mounts(&self) -> Vec<(String, PathBuf)> {
        self.state().mounts.clone()
    }

    pub fn is_mounted(&self, target: impl AsRef<Path>) -> bool {
        self.state()
            .mounts
            .iter()
            .any(|(_, t)| t == target.as_ref())
    }

    fn dispatch(&self, argv: &[String]) -> Result<Output> {
        let args = argv[1..].iter().map(String::as_str).collect::<Vec<_>>();
        match argv[0].as_str() {
            "lvs" => self.lvs(&args),
            "vgs" => self.vgs(&args),
            "lvcreate" => self.lvcreate(&args),
            "lvchange" => self.lvchange(&args),
            "vgchange" => self.vgchange(&args),
            "lvremove" => self.lvremove(&args),
            "lvrename" => self.lvrename(&args),
            "findmnt" => self.findmnt(&args),
            "mount" => self.mount(&args),
            "umount" => self.umount(&args),
            "blkid" => self.blkid(&args),
            "rpm" => self.rpm(&args),
            _ => ok(""),
        }
    }

    /// Split `args` into option values and positional arguments.
    fn parse_args<'a>(
        args: &[&'a str],
        with_value: &[&str],
    ) -> (HashMap<&'a str, &'a str>, Vec<&'a str>) {
        let mut options = HashMap::new();
        let mut positional = vec![];
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if with_value.contains(arg) {
                if let Some(value) = iter.next() {
                    options.insert(*arg, *value);
                }
            } else if arg.starts_with('-') {
                options.insert(*arg, "");
            } else {
                positional.push(*arg);
            }
        }
        (options, positional)
    }

    fn lvs(&self, args: &[&str]) -> Result<Output> {
        let (options, positional) = Self::parse_args(args, &["--separator", "-o", "--units"]);
        let fields = options.get("-o").copied().unwrap_or("vg_name,lv_name");
        let state = self.state();

        let selected = match positional.first() {
            None => state.lvs.iter().collect::<Vec<_>>(),
            Some(tag) if tag.starts_with('@') => state
                .lvs
                .iter()
                .filter(|lv| lv.tags.iter().any(|t| *t == tag[1..]))
                .collect(),
            Some(target) => {
                let Some((vg, name)) = split_target(target) else {
                    return fail(5, format!("\"{target}\": Invalid path for Logical Volume."));
                };
                match state.lvs.iter().find(|lv| lv.vg == vg && lv.name == name) {
                    Some(lv) => vec![lv],
                    None => {
                        return fail(5, format!("Failed to find logical volume \"{vg}/{name}\""))
                    }
                }
            }
        };

        let lines = selected
            .into_iter()
            .map(|lv| match fields {
                "vg_name,lv_name" => format!("  {}|{}", lv.vg, lv.name),
                "lv_size" => format!("  {}", lv.size),
                "origin" => format!("  {}", lv.origin.clone().unwrap_or_default()),
                "pool_lv" => format!("  {}", lv.pool.clone().unwrap_or_default()),
                "lv_tags" => format!("  {}", lv.tags.join(",")),
                "lv_attr" => format!("  {}", lv.attr()),
                "data_percent" => format!("  {:.2}", lv.data_percent),
                "metadata_percent" => format!("  {:.2}", lv.metadata_percent),
                "lv_metadata_size" => format!("  {}", lv.metadata_size),
                other => format!("  unsupported field {other}"),
            })
            .collect::<Vec<_>>();
        ok(lines.join("\n"))
    }

    fn vgs(&self, args: &[&str]) -> Result<Output> {
        let (options, positional) = Self::parse_args(args, &["--separator", "-o", "--units"]);
        let state = self.state();
        let mut names = state.vgs.keys().cloned().collect::<Vec<_>>();
        names.sort();

        match options.get("-o").copied() {
            Some("vg_free") => {
                let Some(vg) = positional.first().and_then(|n| state.vgs.get(*n)) else {
                    return fail(5, "Volume group not found");
                };
                ok(format!("  {}", vg.free))
            }
            _ => {
                let names = names
                    .into_iter()
                    .filter(|name| match positional.first() {
                        Some(tag) if tag.starts_with('@') => {
                            state.vgs[name].tags.iter().any(|t| *t == tag[1..])
                        }
                        Some(vg) => name == vg,
                        None => true,
                    })
                    .map(|name| format!("  {name}"))
                    .collect::<Vec<_>>();
                ok(names.join("\n"))
            }
        }
    }

    fn lvcreate(&self, args: &[&str]) -> Result<Output> {
        let (options, positional) = Self::parse_args(args, &["--virtualsize", "--name"]);
        let Some(name) = options.get("--name").map(|n| n.to_string()) else {
            return fail(3, "Please specify a name");
        };
        let Some((vg, parent)) = positional.first().and_then(|t| split_target(t)) else {
            return fail(3, "Please specify a logical volume");
        };

        let mut state = self.state();
        if state.lvs.iter().any(|lv| lv.vg == vg && lv.name == name) {
            return fail(5, format!("Logical Volume \"{name}\" already exists in volume group \"{vg}\""));
        }
        let Some(parent_lv) = state
            .lvs
            .iter()
            .find(|lv| lv.vg == vg && lv.name == parent)
            .cloned()
        else {
            return fail(5, format!("Failed to find logical volume \"{vg}/{parent}\""));
        };

        let lv = if options.contains_key("--snapshot") {
            FakeLv {
                name,
                origin: Some(parent),
                tags: vec![],
                writable: true,
                active: false,
                activation_skip: true,
                ..parent_lv
            }
        } else {
            if !parent_lv.is_pool {
                return fail(5, format!("{vg}/{parent} is not a thin pool"));
            }
            let size = options
                .get("--virtualsize")
                .and_then(|s| s.trim_end_matches('B').parse::<u64>().ok())
                .unwrap_or_default();
            FakeLv {
                vg,
                name,
                size,
                pool: Some(parent),
                origin: None,
                tags: vec![],
                is_pool: false,
                writable: true,
                active: true,
                activation_skip: false,
                data_percent: 0.0,
                metadata_percent: 0.0,
                metadata_size: 0,
            }
        };
        state.lvs.push(lv);
        ok("")
    }

    fn lvchange(&self, args: &[&str]) -> Result<Output> {
        let (options, positional) = Self::parse_args(
            args,
            &["--addtag", "--permission", "--setactivationskip", "--activate"],
        );
        let Some((vg, name)) = positional.first().and_then(|t| split_target(t)) else {
            return fail(3, "Please specify a logical volume");
        };
        let mut state = self.state();
        let Some(lv) = state
            .lvs
            .iter_mut()
            .find(|lv| lv.vg == vg && lv.name == name)
        else {
            return fail(5, format!("Failed to find logical volume \"{vg}/{name}\""));
        };

        if let Some(tag) = options.get("--addtag") {
            if !lv.tags.iter().any(|t| t == tag) {
                lv.tags.push(tag.to_string());
            }
        }
        if let Some(permission) = options.get("--permission") {
            lv.writable = *permission == "rw";
        }
        if let Some(skip) = options.get("--setactivationskip") {
            lv.activation_skip = *skip == "y";
        }
        if let Some(activate) = options.get("--activate") {
            let activate = *activate == "y";
            if activate && lv.activation_skip && !options.contains_key("-K") {
                // skipped volumes stay inactive unless the skip flag is ignored
                return ok("");
            }
            lv.active = activate;
        }
        ok("")
    }

    fn vgchange(&self, args: &[&str]) -> Result<Output> {
        let (options, positional) = Self::parse_args(args, &["--addtag"]);
        let mut state = self.state();
        let Some(vg) = positional.first().and_then(|n| state.vgs.get_mut(*n)) else {
            return fail(5, "Volume group not found");
        };
        if let Some(tag) = options.get("--addtag") {
            if !vg.tags.iter().any(|t| t == tag) {
                vg.tags.push(tag.to_string());
            }
        }
        ok("")
    }

    fn lvremove(&self, args: &[&str]) -> Result<Output> {
        let (_, positional) = Self::parse_args(args, &[]);
        let Some((vg, name)) = positional.first().and_then(|t| split_target(t)) else {
            return fail(3, "Please specify a logical volume");
        };
        let mut state = self.state();
        let before = state.lvs.len();
        state.lvs.retain(|lv| !(lv.vg == vg && lv.name == name));
        if state.lvs.len() == before {
            return fail(5, format!("Failed to find logical volume \"{vg}/{name}\""));
        }
        for lv in state.lvs.iter_mut() {
            if lv.vg == vg && lv.origin.as_deref() == Some(name.as_str()) {
                lv.origin = None;
            }
        }
        ok("")
    }

    fn lvrename(&self, args: &[&str]) -> Result<Output> {
        let [vg, old, new] = args else {
            return fail(3, "Old and new logical volume names required");
        };
        let mut state = self.state();
        if state.lvs.iter().any(|lv| lv.vg == *vg && lv.name == *new) {
            return fail(5, format!("Logical Volume \"{new}\" already exists"));
        }
        let Some(lv) = state
            .lvs
            .iter_mut()
            .find(|lv| lv.vg == *vg && lv.name == *old)
        else {
            return fail(5, format!("Existing logical volume \"{old}\" not found"));
        };
        lv.name = new.to_string();
        for lv in state.lvs.iter_mut() {
            if lv.vg == *vg && lv.origin.as_deref() == Some(*old) {
                lv.origin = Some(new.to_string());
            }
        }
        let (old_path, new_path) = (format!("/dev/{vg}/{old}"), format!("/dev/{vg}/{new}"));
        for (source, _) in state.static_mounts.values_mut() {
            if *source == old_path {
                source.clone_from(&new_path);
            }
        }
        ok("")
    }

    fn findmnt(&self, args: &[&str]) -> Result<Output> {
        let (options, positional) = Self::parse_args(args, &["-o"]);
        let Some(target) = positional.first().map(PathBuf::from) else {
            return fail(1, "");
        };
        let state = self.state();
        let found = state
            .mounts
            .iter()
            .rev()
            .find(|(_, t)| *t == target)
            .map(|(s, _)| (s.clone(), "rw,relatime".to_owned()))
            .or_else(|| state.static_mounts.get(&target).cloned());

        match (found, options.get("-o").copied()) {
            (Some((_, mount_options)), Some("OPTIONS")) => ok(mount_options),
            (Some((source, _)), _) => ok(source),
            (None, _) => fail(1, ""),
        }
    }

    fn mount(&self, args: &[&str]) -> Result<Output> {
        let (_, positional) = Self::parse_args(args, &["-o"]);
        let [source, target] = positional.as_slice() else {
            return fail(1, "bad usage");
        };
        let target = PathBuf::from(target);
        let mut state = self.state();

        let fixture = state
            .fixtures
            .iter()
            .find(|(suffix, _)| source.ends_with(suffix.as_str()))
            .map(|(_, dir)| dir.clone());
        if let Some(dir) = fixture {
            if let Err(error) = copy_tree(&dir, &target) {
                return fail(32, format!("fixture copy failed: {error}"));
            }
        }
        state.mounts.push((source.to_string(), target));
        ok("")
    }

    fn umount(&self, args: &[&str]) -> Result<Output> {
        let (_, positional) = Self::parse_args(args, &[]);
        let Some(target) = positional.first().map(PathBuf::from) else {
            return fail(1, "bad usage");
        };
        let mut state = self.state();
        match state.mounts.iter().rposition(|(_, t)| *t == target) {
            Some(pos) => {
                state.mounts.remove(pos);
                ok("")
            }
            None => fail(32, format!("umount: {}: not mounted.", target.display())),
        }
    }

    fn blkid(&self, args: &[&str]) -> Result<Output> {
        let (options, positional) = Self::parse_args(args, &["-o", "-s"]);
        let Some(device) = positional.first() else {
            return fail(2, "");
        };
        let state = self.state();
        match options.get("-s").copied() {
            Some("TYPE") => ok(state
                .fs_types
                .get(*device)
                .cloned()
                .unwrap_or_else(|| "ext4".to_owned())),
            Some("UUID") => {
                let name = device.rsplit('/').next().unwrap_or(device);
                ok(format!("uuid-{name}"))
            }
            _ => fail(2, ""),
        }
    }

    fn rpm(&self, args: &[&str]) -> Result<Output> {
        let (options, positional) =
            Self::parse_args(args, &["--root", "--dbpath", "--qf", "--whatprovides"]);
        let state = self.state();
        let find = |package: &str| {
            state
                .packages
                .iter()
                .find(|p| p.nvra == package || p.name == package)
        };

        if options.contains_key("-qa") {
            let names = state
                .packages
                .iter()
                .map(|p| p.name.clone())
                .collect::<Vec<_>>();
            return ok(names.join("\n"));
        }
        if let Some(capability) = options.get("--whatprovides") {
            let providers = state
                .packages
                .iter()
                .filter(|p| p.provides.iter().any(|c| c == capability))
                .map(|p| p.nvra.clone())
                .collect::<Vec<_>>();
            if providers.is_empty() {
                return fail(1, format!("no package provides {capability}"));
            }
            return ok(providers.join("\n"));
        }
        let Some(package) = positional.first().and_then(|p| find(p)) else {
            return fail(1, "package is not installed");
        };
        if options.contains_key("-ql") {
            return ok(package.files.join("\n"));
        }
        match options.get("--qf") {
            Some(tag) => ok(package
                .scripts
                .get(*tag)
                .cloned()
                .unwrap_or_else(|| "(none)".to_owned())),
            None => ok(package.nvra.clone()),
        }
    }
}

#[async_trait]
impl CommandExecutor for FakeHost {
    async fn execute(&self, invocation: &Invocation) -> Result<Output> {
        let argv = invocation.argv.clone();
        let line = argv.join(" ");
        let injected = {
            let mut state = self.state();
            state.calls.push(argv.clone());
            state.failures.iter().any(|p| line.contains(p.as_str()))
        };
        if injected {
            return fail(1, format!("injected failure: {line}"));
        }
        self.dispatch(&argv)
    }
}
