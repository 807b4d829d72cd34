/// Filesystem view of a container
///
/// The host mount hierarchy is duplicated below a private mount base and every
/// mount point is then re-mounted according to the directory rule that governs
/// it. The writable layers (upper directories of overlays and the backing
/// directories of hidden paths) live below a per-run temp base, which is also
/// where result files are retrieved from.
use crate::cgroup::probe::unescape_mount_path;
use crate::namespace::ContainerIdentity;
use crate::types::{BenchError, DirMode, Result};
use nix::mount::{mount, umount, umount2, MntFlags, MsFlags};
use nix::unistd::{access, pivot_root, AccessFlags};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

/// Directory layout of one container below its private temp directory
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerLayout {
    pub root: PathBuf,
    /// Root of the duplicated mount hierarchy the tool pivots into
    pub mount_base: PathBuf,
    /// Writable layers, mirroring host paths
    pub temp_base: PathBuf,
    /// Work directories of overlay mounts
    pub work_base: PathBuf,
}

impl ContainerLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            mount_base: root.join("mount"),
            temp_base: root.join("temp"),
            work_base: root.join("overlayfs"),
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [&self.mount_base, &self.temp_base, &self.work_base] {
            fs::create_dir_all(dir).map_err(|e| {
                BenchError::Mount(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Location of host path `path` below `base`
    pub fn below(base: &Path, path: &Path) -> PathBuf {
        base.join(path.strip_prefix("/").unwrap_or(path))
    }
}

/// Check caller-provided rules: absolute, normalized, and covering `/`
pub fn validate_dir_rules(rules: &BTreeMap<PathBuf, DirMode>) -> Result<()> {
    if !rules.contains_key(Path::new("/")) {
        return Err(BenchError::Config(
            "Directory rules need a mode for the root directory".to_string(),
        ));
    }
    for path in rules.keys() {
        if !path.is_absolute() {
            return Err(BenchError::Config(format!(
                "Directory rule for relative path {}",
                path.display()
            )));
        }
        let normal = path
            .components()
            .all(|c| matches!(c, Component::RootDir | Component::Normal(_)));
        if !normal {
            return Err(BenchError::Config(format!(
                "Directory rule path {} is not normalized",
                path.display()
            )));
        }
    }
    Ok(())
}

fn is_below(path: &Path, ancestor: &Path) -> bool {
    path.starts_with(ancestor)
}

/// Mode that applies to `path`, or `None` if nothing needs to be mounted there
pub fn determine_mode(
    rules: &BTreeMap<PathBuf, DirMode>,
    path: &Path,
    fstype: Option<&str>,
) -> Option<DirMode> {
    if fstype == Some("proc") {
        // replaced by a fresh instance later
        return Some(DirMode::ReadOnly);
    }
    if is_below(path, Path::new("/proc")) {
        return None;
    }

    let mut parent_mode = None;
    let mut result_mode = None;
    for (dir, mode) in rules {
        if is_below(path, dir) {
            if path != dir {
                parent_mode = Some(*mode);
            }
            result_mode = Some(*mode);
        }
    }
    let result_mode = result_mode?;

    if result_mode == DirMode::Overlay {
        let special_location = is_below(path, Path::new("/dev"))
            || is_below(path, Path::new("/sys"))
            || matches!(fstype, Some("cgroup") | Some("cgroup2") | Some("fuse.lxcfs"));
        if special_location {
            return Some(DirMode::ReadOnly);
        }
        let no_overlay_support = fstype.is_some_and(|fs| {
            fs.starts_with("fuse.") || matches!(fs, "autofs" | "vfat" | "ntfs")
        });
        if no_overlay_support {
            log::debug!(
                "Using read-only mode for {} because overlays do not support {:?}",
                path.display(),
                fstype
            );
            return Some(DirMode::ReadOnly);
        }
    }

    if result_mode == DirMode::Hidden && parent_mode == Some(DirMode::Hidden) {
        return None;
    }
    Some(result_mode)
}

/// One line of /proc/self/mounts
#[derive(Clone, Debug, PartialEq)]
pub struct MountPoint {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: BTreeSet<String>,
}

pub fn parse_mount_points(content: &str) -> Vec<MountPoint> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() < 4 {
                return None;
            }
            Some(MountPoint {
                source: unescape_mount_path(fields[0]),
                target: PathBuf::from(unescape_mount_path(fields[1])),
                fstype: fields[2].to_string(),
                options: fields[3].split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

pub fn read_mount_points() -> Result<Vec<MountPoint>> {
    let content = fs::read_to_string("/proc/self/mounts")
        .map_err(|e| BenchError::Mount(format!("Failed to read /proc/self/mounts: {}", e)))?;
    Ok(parse_mount_points(&content))
}

/// Flags that a bind remount has to repeat, the kernel refuses to drop
/// locked flags inside a user namespace
pub fn locked_flags(options: &BTreeSet<String>) -> MsFlags {
    let mut flags = MsFlags::empty();
    for (option, flag) in [
        ("ro", MsFlags::MS_RDONLY),
        ("nosuid", MsFlags::MS_NOSUID),
        ("nodev", MsFlags::MS_NODEV),
        ("noexec", MsFlags::MS_NOEXEC),
        ("noatime", MsFlags::MS_NOATIME),
        ("nodiratime", MsFlags::MS_NODIRATIME),
        ("relatime", MsFlags::MS_RELATIME),
    ] {
        if options.contains(option) {
            flags |= flag;
        }
    }
    flags
}

pub fn make_bind_mount(source: &Path, target: &Path, recursive: bool, private: bool) -> Result<()> {
    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(Some(source), target, None::<&str>, flags, None::<&str>).map_err(|e| {
        BenchError::Mount(format!(
            "Failed to bind {} to {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })?;
    if private {
        let mut propagation = MsFlags::MS_PRIVATE;
        if recursive {
            propagation |= MsFlags::MS_REC;
        }
        mount(None::<&str>, target, None::<&str>, propagation, None::<&str>).map_err(|e| {
            BenchError::Mount(format!("Failed to make {} private: {}", target.display(), e))
        })?;
    }
    Ok(())
}

fn remount(target: &Path, options: &BTreeSet<String>, extra: MsFlags) -> nix::Result<()> {
    let flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | locked_flags(options) | extra;
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>)
}

fn escape_overlay_path(path: &Path) -> String {
    let mut escaped = String::new();
    for c in path.to_string_lossy().chars() {
        if matches!(c, '\\' | ',' | ':') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn overlay_options(lower: &Path, upper: &Path, work: &Path) -> String {
    format!(
        "lowerdir={},upperdir={},workdir={}",
        escape_overlay_path(lower),
        escape_overlay_path(upper),
        escape_overlay_path(work)
    )
}

/// How overlays ended up being mounted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlayKind {
    Kernel,
    Fuse,
}

/// Mount an overlay, falling back to fuse-overlayfs when the kernel refuses
pub fn make_overlay_mount(target: &Path, lower: &Path, upper: &Path, work: &Path) -> Result<OverlayKind> {
    let options = overlay_options(lower, upper, work);
    log::debug!("Creating overlay mount on {}: {}", target.display(), options);
    let kernel_error = match mount(
        Some("none"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    ) {
        Ok(()) => return Ok(OverlayKind::Kernel),
        Err(e) => e,
    };

    let status = Command::new("fuse-overlayfs")
        .arg("-o")
        .arg(&options)
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => Ok(OverlayKind::Fuse),
        Ok(status) => Err(BenchError::Mount(format!(
            "Creating overlay mount for {} failed: {}, and fuse-overlayfs exited with {}. \
             Use another directory mode for this path.",
            lower.display(),
            kernel_error,
            status
        ))),
        Err(e) => Err(BenchError::Mount(format!(
            "Creating overlay mount for {} failed: {}, and fuse-overlayfs is unavailable: {}. \
             Use another directory mode for this path.",
            lower.display(),
            kernel_error,
            e
        ))),
    }
}

/// What building the mount tree produced
#[derive(Debug, Default)]
pub struct MountReport {
    pub fuse_overlays: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Duplicate the host mount hierarchy below `layout.mount_base` and apply the
/// directory rules. Runs inside the private mount namespace of the container.
pub fn duplicate_mount_hierarchy(
    layout: &ContainerLayout,
    rules: &BTreeMap<PathBuf, DirMode>,
) -> Result<MountReport> {
    let mut report = MountReport::default();
    make_bind_mount(Path::new("/"), &layout.mount_base, true, true)?;

    // every rule path becomes a mount point so that the loop below covers it
    for dir in rules.keys() {
        let mount_path = ContainerLayout::below(&layout.mount_base, dir);
        if let Err(e) = make_bind_mount(&mount_path, &mount_path, false, false) {
            // btrfs subvolumes refuse non-recursive binds
            if let Err(e2) = make_bind_mount(&mount_path, &mount_path, true, false) {
                log::debug!("{}; {}", e, e2);
            }
        }
        fs::create_dir_all(ContainerLayout::below(&layout.temp_base, dir))?;
    }

    for mount_point in read_mount_points()? {
        let Ok(relative) = mount_point.target.strip_prefix(&layout.mount_base) else {
            continue;
        };
        let host_path = Path::new("/").join(relative);
        let Some(mut mode) = determine_mode(rules, &host_path, Some(&mount_point.fstype)) else {
            continue;
        };

        let mut path = host_path.clone();
        if !is_traversable_parent(&path) {
            // hide the inaccessible ancestor, or loosened permissions would expose it
            while let Some(parent) = path.parent().map(Path::to_path_buf) {
                if is_traversable_parent(&parent) || parent == Path::new("/") {
                    break;
                }
                path = parent;
            }
            log::debug!(
                "Hiding inaccessible {} because it contains mount point {}",
                path.display(),
                host_path.display()
            );
            mode = DirMode::Hidden;
        } else {
            log::debug!("Mounting {} as {}", path.display(), mode);
        }

        let mount_path = ContainerLayout::below(&layout.mount_base, &path);
        let temp_path = ContainerLayout::below(&layout.temp_base, &path);
        let work_path = ContainerLayout::below(&layout.work_base, &path);

        match mode {
            DirMode::Overlay => {
                fs::create_dir_all(&temp_path)?;
                fs::create_dir_all(&work_path)?;
                // the bind underneath is not needed once the overlay covers it
                let _ = umount(&mount_path);
                if make_overlay_mount(&mount_path, &path, &temp_path, &work_path)? == OverlayKind::Fuse {
                    report.fuse_overlays.push(path.clone());
                }
            }
            DirMode::Hidden => {
                fs::create_dir_all(&temp_path)?;
                let _ = umount(&mount_path);
                make_bind_mount(&temp_path, &mount_path, false, false)?;
            }
            DirMode::ReadOnly => {
                if let Err(e) = remount(&mount_path, &mount_point.options, MsFlags::MS_RDONLY) {
                    recreate_mount(&path, &mount_path, &mount_point, MsFlags::MS_RDONLY, e, &mut report)?;
                }
            }
            DirMode::FullAccess => {
                if let Err(e) = remount(&mount_path, &mount_point.options, MsFlags::empty()) {
                    recreate_mount(&path, &mount_path, &mount_point, MsFlags::empty(), e, &mut report)?;
                }
            }
        }
    }

    if !report.fuse_overlays.is_empty() {
        report.warnings.push(format!(
            "Kernel overlay mounts were refused, using fuse-overlayfs for {:?}, which is slower",
            report.fuse_overlays
        ));
    }
    Ok(report)
}

/// Mount points below an overlay or hidden directory vanished and are bound again
fn recreate_mount(
    path: &Path,
    mount_path: &Path,
    mount_point: &MountPoint,
    extra: MsFlags,
    error: nix::Error,
    report: &mut MountReport,
) -> Result<()> {
    if error == nix::errno::Errno::EACCES {
        report.warnings.push(format!(
            "Cannot mount {}, directory may be missing from container",
            path.display()
        ));
        return Ok(());
    }
    make_bind_mount(path, mount_path, true, true)?;
    remount(mount_path, &mount_point.options, extra).map_err(|e| {
        BenchError::Mount(format!("Failed to remount {}: {}", mount_path.display(), e))
    })
}

fn is_traversable_parent(path: &Path) -> bool {
    match path.parent() {
        Some(parent) => access(parent, AccessFlags::X_OK).is_ok(),
        None => true,
    }
}

/// Keep mount events of the container from propagating to the host
pub fn make_mounts_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| BenchError::Mount(format!("Failed to make mounts private: {}", e)))
}

/// Mount a memory-backed file system over the container root so that all
/// writable layers stay in RAM
pub fn mount_tmpfs(target: &Path) -> Result<()> {
    mount(
        Some("tmpfs"),
        target,
        Some("tmpfs"),
        MsFlags::empty(),
        Some("mode=0700"),
    )
    .map_err(|e| BenchError::Mount(format!("Failed to mount tmpfs on {}: {}", target.display(), e)))
}

/// Content of the synthesized /etc files
pub fn system_config_files(identity: &ContainerIdentity) -> Vec<(&'static str, String)> {
    let hostname = identity.hostname.as_deref().unwrap_or("localhost");
    vec![
        (
            "nsswitch.conf",
            "passwd: files\ngroup: files\nshadow: files\nhosts: files\nnetworks: files\n\n\
             protocols: db files\nservices: db files\nethers: db files\nrpc: db files\n\n\
             netgroup: files\nautomount: files\n"
                .to_string(),
        ),
        (
            "passwd",
            format!(
                "root:x:0:0:root:/root:/bin/bash\n\
                 {user}:x:{uid}:{gid}:{user}:{home}:/bin/bash\n\
                 nobody:x:65534:65534:nobody:/:/bin/false\n",
                user = identity.user,
                uid = identity.uid,
                gid = identity.gid,
                home = identity.home
            ),
        ),
        (
            "group",
            format!(
                "root:x:0:\n{}:x:{}:\nnogroup:x:65534:\n",
                identity.user, identity.gid
            ),
        ),
        ("hostname", format!("{}\n", hostname)),
        (
            "hosts",
            format!(
                "127.0.0.1       localhost {}\n\
                 ::1     localhost ip6-localhost ip6-loopback\n\
                 ff02::1 ip6-allnodes\n\
                 ff02::2 ip6-allrouters\n",
                hostname
            ),
        ),
    ]
}

/// Write the /etc files into the writable layer. They show through an overlay
/// of /etc and are bind-mounted into place otherwise (after the mount tree exists).
pub fn write_system_config(layout: &ContainerLayout, identity: &ContainerIdentity) -> Result<()> {
    let etc = layout.temp_base.join("etc");
    fs::create_dir_all(&etc)?;
    for (name, content) in system_config_files(identity) {
        fs::write(etc.join(name), content)?;
    }
    Ok(())
}

pub fn bind_system_config(
    layout: &ContainerLayout,
    rules: &BTreeMap<PathBuf, DirMode>,
    identity: &ContainerIdentity,
) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    if determine_mode(rules, Path::new("/etc"), None) != Some(DirMode::Overlay) {
        let etc = layout.temp_base.join("etc");
        let target_etc = layout.mount_base.join("etc");
        for (name, _) in system_config_files(identity) {
            make_bind_mount(&etc.join(name), &target_etc.join(name), false, true)?;
        }
    }

    let home = ContainerLayout::below(&layout.mount_base, Path::new(&identity.home));
    if let Err(e) = fs::create_dir_all(&home) {
        warnings.push(format!(
            "Home directory {} cannot be created in the container ({}), \
             use overlay or hidden mode for its parent",
            identity.home, e
        ));
    }
    Ok(warnings)
}

/// Make `new_root` the root of the calling process' mount namespace and drop
/// the old root
pub fn pivot_into(new_root: &Path) -> Result<()> {
    std::env::set_current_dir(new_root)
        .map_err(|e| BenchError::Mount(format!("Cannot enter {}: {}", new_root.display(), e)))?;
    // stacking the old root on top of the new one avoids a put_old directory
    pivot_root(".", ".")
        .map_err(|e| BenchError::Mount(format!("pivot_root failed: {}", e)))?;
    umount2(".", MntFlags::MNT_DETACH)
        .map_err(|e| BenchError::Mount(format!("Failed to detach old root: {}", e)))?;
    std::env::set_current_dir("/")
        .map_err(|e| BenchError::Mount(format!("Cannot enter new root: {}", e)))?;
    Ok(())
}

/// Fresh /proc for the PID namespace of the caller
pub fn mount_proc() -> Result<()> {
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| BenchError::Mount(format!("Failed to mount /proc: {}", e)))
}

/// Overlay work directories are left with mode 000, which blocks removal
pub fn make_removable(root: &Path) -> io::Result<()> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let metadata = match fs::symlink_metadata(&dir) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if !metadata.is_dir() {
            continue;
        }
        if metadata.permissions().mode() & 0o700 != 0o700 {
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        for entry in fs::read_dir(&dir)?.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                pending.push(entry.path());
            }
        }
    }
    Ok(())
}
