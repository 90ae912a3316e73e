//! Mount tree tests against the real kernel.
//!
//! These need root.  Each test moves its own thread into a private mount
//! namespace first, so nothing it mounts is visible to the rest of the host.

use std::{fs, path::Path, thread};

use nix::{
    errno::Errno,
    libc,
    mount::{MntFlags, MsFlags},
    sched::{self, CloneFlags},
    sys::prctl,
    unistd::Uid,
};
use nsmount::{
    mount::{self, MountApi, MountSpec, MountTarget, MountTreeBuilder},
    sys, ErrorKind,
};
use tempfile::TempDir;

/// A scratch directory in a private mount namespace, or `None` when the
/// test cannot run here.
fn isolated() -> Option<TempDir> {
    if !Uid::effective().is_root() {
        eprintln!("skipping: needs root");
        return None;
    }
    sched::unshare(CloneFlags::CLONE_NEWNS).unwrap();
    mount::make_private().unwrap();

    Some(tempfile::tempdir().unwrap())
}

fn mkdir(dir: &TempDir, name: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::create_dir(&path).unwrap();
    path
}

fn mounted(path: &Path) -> bool {
    mount::is_mount_point(path).unwrap()
}

fn has_option(path: &Path, option: &str) -> bool {
    let info = mount::find_mount(path).unwrap().unwrap();
    info.options.split(',').any(|o| o == option)
}

fn is_shared(path: &Path) -> bool {
    let info = mount::find_mount(path).unwrap().unwrap();
    info.optional_fields.iter().any(|f| f.starts_with("shared:"))
}

/// Makes `fsopen(2)` and `open_tree(2)` fail with `ENOSYS` in the calling
/// thread, the way they do on a kernel that predates them.
fn hide_detached_api() {
    // BPF_LD | BPF_W | BPF_ABS, BPF_JMP | BPF_JEQ | BPF_K, BPF_RET | BPF_K
    const LD_NR: u16 = 0x20;
    const JEQ: u16 = 0x15;
    const RET: u16 = 0x06;
    const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;
    const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
    const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

    let insn = |code, jt, k| libc::sock_filter { code, jt, jf: 0, k };
    let mut filter = [
        insn(LD_NR, 0, 0),
        insn(JEQ, 2, libc::SYS_fsopen as u32),
        insn(JEQ, 1, libc::SYS_open_tree as u32),
        insn(RET, 0, SECCOMP_RET_ALLOW),
        insn(RET, 0, SECCOMP_RET_ERRNO | libc::ENOSYS as u32),
    ];
    let prog = libc::sock_fprog {
        len: filter.len() as u16,
        filter: filter.as_mut_ptr(),
    };

    prctl::set_no_new_privs().unwrap();
    let res = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0,
            &prog as *const libc::sock_fprog,
        )
    };
    assert_eq!(res, 0, "seccomp: {}", Errno::last());
}

#[test]
fn tmpfs_gets_its_size() {
    let Some(dir) = isolated() else { return };
    let target = mkdir(&dir, "tmp");

    let spec = MountSpec::new("tmpfs", &target).with_data("size=64m");
    MountTreeBuilder::default().build(&spec).unwrap();

    assert_eq!(mount::mount_fstype(&target).unwrap().as_deref(), Some("tmpfs"));
    let info = mount::find_mount(&target).unwrap().unwrap();
    assert!(
        info.super_options.contains("size=65536k"),
        "{}",
        info.super_options
    );

    assert!(mount::teardown(&spec.target).unwrap());
    assert!(!mounted(&target));
}

#[test]
fn unknown_filesystem_is_rejected_without_fallback() {
    let Some(dir) = isolated() else { return };
    let target = mkdir(&dir, "bogus");

    let spec = MountSpec::new("bogusfs9", &target);
    let err = MountTreeBuilder::default().build(&spec).unwrap_err();

    assert_eq!(err.kind, ErrorKind::InvalidMountSpec);
    assert!(err.to_string().contains("bogusfs9"));
    assert!(!mounted(&target));
}

#[test]
fn classic_and_detached_bind_agree() {
    let Some(dir) = isolated() else { return };
    let source = mkdir(&dir, "source");
    fs::write(source.join("hello"), "world").unwrap();

    let mut types = Vec::new();
    for (api, name) in [(MountApi::Auto, "detached"), (MountApi::Classic, "classic")] {
        let target = mkdir(&dir, name);
        let spec = MountSpec::bind(&source, &target).with_flags(MsFlags::MS_RDONLY);
        MountTreeBuilder::new(api).build(&spec).unwrap();

        assert_eq!(fs::read_to_string(target.join("hello")).unwrap(), "world");
        assert!(fs::write(target.join("new"), "").is_err());

        let info = mount::find_mount(&target).unwrap().unwrap();
        assert!(info.options.split(',').any(|o| o == "ro"), "{}", info.options);
        types.push(info.fstype);
    }

    assert_eq!(types[0], types[1]);
}

#[test]
fn unmounting_a_plain_directory() {
    let Some(dir) = isolated() else { return };
    let target = mkdir(&dir, "plain");

    assert!(!mount::teardown(&MountTarget::new(&target)).unwrap());

    let err = sys::unmount(&target, MntFlags::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotMounted);
}

#[test]
fn failed_build_rolls_back() {
    let Some(dir) = isolated() else { return };
    let first = mkdir(&dir, "first");
    let second = mkdir(&dir, "second");
    let third = mkdir(&dir, "third");
    let fourth = mkdir(&dir, "fourth");

    let specs = [
        MountSpec::new("tmpfs", &first),
        MountSpec::new("tmpfs", &second),
        MountSpec::new("bogusfs9", &third),
        MountSpec::new("tmpfs", &fourth),
    ];
    let err = MountTreeBuilder::default().build_all(&specs).unwrap_err();

    assert_eq!(err.spec.target.path, third);
    for path in [&first, &second, &third, &fourth] {
        assert!(!mounted(path), "{path:?} is still mounted");
    }
}

#[test]
fn mount_through_proc_reference() {
    let Some(dir) = isolated() else { return };
    let target = mkdir(&dir, "via");

    // `/proc/thread-self/root` resolves to our own root.
    let relative = target.strip_prefix("/").unwrap();
    let spec = MountSpec::new("tmpfs", &target).with_target(MountTarget::via(
        &target,
        Path::new("/proc/thread-self/root").join(relative),
    ));
    MountTreeBuilder::new(MountApi::Classic).build(&spec).unwrap();

    assert!(mounted(&target));
    assert!(mount::teardown(&spec.target).unwrap());
}

#[test]
fn bind_takes_per_mount_flags() {
    let Some(dir) = isolated() else { return };
    let source = mkdir(&dir, "source");

    for (api, name) in [(MountApi::Auto, "detached"), (MountApi::Classic, "classic")] {
        let target = mkdir(&dir, name);
        let flags = MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        let spec = MountSpec::bind(&source, &target).with_flags(flags);
        MountTreeBuilder::new(api).build(&spec).unwrap();

        for option in ["noexec", "nosuid", "nodev"] {
            assert!(has_option(&target, option), "{name}: no {option}");
        }
        assert!(has_option(&target, "rw"), "{name}");
    }
}

#[test]
fn propagation_of_an_existing_mount() {
    let Some(dir) = isolated() else { return };

    for (api, name) in [(MountApi::Auto, "detached"), (MountApi::Classic, "classic")] {
        let target = mkdir(&dir, name);
        let builder = MountTreeBuilder::new(api);
        builder.build(&MountSpec::new("tmpfs", &target)).unwrap();
        assert!(!is_shared(&target), "{name}");

        builder
            .build(&MountSpec::modify(&target, MsFlags::MS_SHARED))
            .unwrap();
        assert!(is_shared(&target), "{name}");
        assert_eq!(mount::mount_fstype(&target).unwrap().as_deref(), Some("tmpfs"));

        let spec: MountSpec = format!(":{}:none:private", target.display()).parse().unwrap();
        builder.build(&spec).unwrap();
        assert!(!is_shared(&target), "{name}");
    }
}

#[test]
fn remount_of_an_existing_mount() {
    let Some(dir) = isolated() else { return };
    let target = mkdir(&dir, "tmp");
    let builder = MountTreeBuilder::default();
    builder.build(&MountSpec::new("tmpfs", &target)).unwrap();
    fs::write(target.join("before"), "").unwrap();

    builder
        .build(&MountSpec::modify(&target, MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY))
        .unwrap();

    assert!(has_option(&target, "ro"));
    assert!(target.join("before").exists());
    assert!(fs::write(target.join("after"), "").is_err());
}

#[test]
fn failed_build_keeps_modified_mounts() {
    let Some(dir) = isolated() else { return };
    let existing = mkdir(&dir, "existing");
    let bogus = mkdir(&dir, "bogus");
    MountTreeBuilder::default()
        .build(&MountSpec::new("tmpfs", &existing))
        .unwrap();

    let specs = [
        MountSpec::modify(&existing, MsFlags::MS_SHARED),
        MountSpec::new("bogusfs9", &bogus),
    ];
    MountTreeBuilder::default().build_all(&specs).unwrap_err();

    assert!(mounted(&existing));
    assert!(!mounted(&bogus));
}

#[test]
fn falls_back_without_detached_api() {
    // The filter sticks to the thread it is installed on.
    thread::spawn(|| {
        let Some(dir) = isolated() else { return };
        if !mount::detached_api_supported() {
            eprintln!("skipping: detached mount API already missing");
            return;
        }
        let source = mkdir(&dir, "source");
        fs::write(source.join("hello"), "world").unwrap();
        let bound = mkdir(&dir, "bound");
        let tmp = mkdir(&dir, "tmp");

        hide_detached_api();
        assert!(sys::fs_open("tmpfs").unwrap_err().is_unsupported());

        let specs = [
            MountSpec::bind(&source, &bound).with_flags(MsFlags::MS_RDONLY),
            MountSpec::new("tmpfs", &tmp).with_data("size=1m"),
        ];
        MountTreeBuilder::new(MountApi::Auto).build_all(&specs).unwrap();

        assert_eq!(fs::read_to_string(bound.join("hello")).unwrap(), "world");
        assert!(has_option(&bound, "ro"));
        assert_eq!(mount::mount_fstype(&tmp).unwrap().as_deref(), Some("tmpfs"));

        // Only `Auto` falls back.
        let other = mkdir(&dir, "other");
        let err = MountTreeBuilder::new(MountApi::Detached)
            .build(&MountSpec::bind(&source, &other))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedApi);
        assert!(!mounted(&other));
    })
    .join()
    .unwrap();
}
