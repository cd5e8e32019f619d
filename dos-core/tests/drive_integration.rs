//! Integration tests for drives over real host directories.

use std::fs;
use std::io::{Cursor, SeekFrom, Write};
use std::path::Path;

use dos_core::fs::{short_name, DirectoryCache, OVERLAY_PREFIX};
use dos_core::{
    load_bundle, DosError, Drive, DriveManager, DriveType, FatAttributes, LocalDrive, MediaKind, MountTable, OpenMode,
    OverlayDrive, VirtualRegistry,
};

fn populate(root: &Path, files: &[(&str, &[u8])]) {
    for (name, data) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
    }
}

fn overlay(base: &Path, upper: &Path) -> OverlayDrive {
    OverlayDrive::new(LocalDrive::new(base, MediaKind::HardDisk), upper).unwrap()
}

fn names(drive: &mut dyn Drive, pattern: &str) -> Vec<String> {
    drive
        .list(pattern, FatAttributes::DIRECTORY)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect()
}

#[test]
fn test_tombstone_survives_remount_until_recreated() {
    let base = tempfile::tempdir().unwrap();
    let upper = tempfile::tempdir().unwrap();
    populate(base.path(), &[("REPORT.TXT", b"quarterly numbers")]);

    let mut drive = overlay(base.path(), upper.path());
    drive.unlink("REPORT.TXT").unwrap();
    assert!(names(&mut drive, "*.*").is_empty());
    drop(drive);

    // Same overlay directory, fresh drive
    let mut drive = overlay(base.path(), upper.path());
    assert!(names(&mut drive, "*.*").is_empty());
    assert!(drive.state().is_deleted_file("REPORT.TXT"));
    assert!(matches!(drive.open("REPORT.TXT", OpenMode::Read), Err(DosError::NotFound(_))));

    drive.write_file("REPORT.TXT", b"rewritten").unwrap();
    assert_eq!(names(&mut drive, "*.*"), vec!["REPORT.TXT"]);
    assert_eq!(drive.read_file("REPORT.TXT").unwrap(), b"rewritten");
    assert!(!drive.state().is_deleted_file("REPORT.TXT"));
    drop(drive);

    assert_eq!(fs::read(base.path().join("REPORT.TXT")).unwrap(), b"quarterly numbers");
    let markers: Vec<_> = fs::read_dir(upper.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(OVERLAY_PREFIX))
        .collect();
    assert!(markers.is_empty());

    let mut drive = overlay(base.path(), upper.path());
    assert_eq!(drive.read_file("REPORT.TXT").unwrap(), b"rewritten");
}

#[test]
fn test_copy_on_write_leaves_base_untouched() {
    let base = tempfile::tempdir().unwrap();
    let upper = tempfile::tempdir().unwrap();
    let original: Vec<u8> = (0u8..=255).collect();
    populate(base.path(), &[("Game Data/levels.dat", &original)]);

    let mut drive = overlay(base.path(), upper.path());
    let mut file = drive.open("GAMEDA~1\\LEVELS.DAT", OpenMode::ReadWrite).unwrap();
    file.seek(SeekFrom::Start(100)).unwrap();
    assert_eq!(file.write(b"PATCHED").unwrap(), 7);
    file.seek(SeekFrom::Start(100)).unwrap();
    let mut buf = [0u8; 7];
    assert_eq!(file.read(&mut buf).unwrap(), 7);
    assert_eq!(&buf, b"PATCHED");
    assert_eq!(file.size().unwrap(), 256);
    drop(file);

    assert_eq!(fs::read(base.path().join("Game Data").join("levels.dat")).unwrap(), original);
    let copied = fs::read(upper.path().join("GAMEDA~1").join("LEVELS.DAT")).unwrap();
    assert_eq!(&copied[100..107], b"PATCHED");
    assert_eq!(&copied[..100], &original[..100]);
}

#[test]
fn test_read_only_open_never_copies() {
    let base = tempfile::tempdir().unwrap();
    let upper = tempfile::tempdir().unwrap();
    populate(base.path(), &[("a.txt", b"a")]);

    let mut drive = overlay(base.path(), upper.path());
    let mut file = drive.open("A.TXT", OpenMode::ReadNoModify).unwrap();
    assert!(matches!(file.write(b"x"), Err(DosError::AccessDenied(_))));
    drop(file);
    assert!(!upper.path().join("A.TXT").exists());
}

#[test]
fn test_tombstones_never_coexist_with_overlay_files() {
    let base = tempfile::tempdir().unwrap();
    let upper = tempfile::tempdir().unwrap();
    populate(
        base.path(),
        &[("a.txt", b"a"), ("b.txt", b"b"), ("c.txt", b"c"), ("dir/d.txt", b"d")],
    );

    let mut drive = overlay(base.path(), upper.path());
    drive.unlink("A.TXT").unwrap();
    drive.write_file("B.TXT", b"changed").unwrap();
    drive.unlink("B.TXT").unwrap();
    drive.rename("C.TXT", "E.TXT").unwrap();
    drive.unlink("DIR\\D.TXT").unwrap();
    drive.write_file("A.TXT", b"back").unwrap();

    let deleted: Vec<String> = drive.state().deleted_files().map(str::to_string).collect();
    assert_eq!(deleted, vec!["B.TXT", "C.TXT", "DIR\\D.TXT"]);
    let visible = names(&mut drive, "*.*");
    for path in &deleted {
        let host: std::path::PathBuf = path.split('\\').fold(upper.path().to_path_buf(), |p, c| p.join(c));
        assert!(!host.is_file(), "{} is both tombstoned and in the overlay", path);
        assert!(!visible.contains(path));
    }
    assert_eq!(visible, vec!["DIR", "A.TXT", "E.TXT"]);
    assert!(names(&mut drive, "DIR\\*.*").iter().all(|n| n == "." || n == ".."));
}

#[test]
fn test_directory_tombstone_survives_remount() {
    let base = tempfile::tempdir().unwrap();
    let upper = tempfile::tempdir().unwrap();
    populate(base.path(), &[("saves/slot1.sav", b"1"), ("keep.txt", b"k")]);

    let mut drive = overlay(base.path(), upper.path());
    drive.unlink("SAVES\\SLOT1.SAV").unwrap();
    drive.remove_directory("SAVES").unwrap();
    drop(drive);

    let mut drive = overlay(base.path(), upper.path());
    assert_eq!(names(&mut drive, "*.*"), vec!["KEEP.TXT"]);
    assert!(!drive.test_directory("SAVES"));
    assert!(matches!(drive.write_file("SAVES\\NEW.SAV", b"n"), Err(DosError::PathNotFound(_))));
    assert!(base.path().join("saves").join("slot1.sav").exists());
}

#[test]
fn test_overlay_only_tree_is_rebuilt_on_mount() {
    let base = tempfile::tempdir().unwrap();
    let upper = tempfile::tempdir().unwrap();
    populate(base.path(), &[("base.txt", b"b")]);

    let mut drive = overlay(base.path(), upper.path());
    drive.make_directory("MODS").unwrap();
    drive.make_directory("MODS\\MAPS").unwrap();
    drive.write_file("MODS\\MAPS\\E1M1.WAD", b"wad").unwrap();
    drop(drive);

    let mut drive = overlay(base.path(), upper.path());
    assert_eq!(names(&mut drive, "*.*"), vec!["MODS", "BASE.TXT"]);
    assert_eq!(names(&mut drive, "MODS\\MAPS\\*.*"), vec![".", "..", "E1M1.WAD"]);
    assert_eq!(drive.read_file("MODS\\MAPS\\E1M1.WAD").unwrap(), b"wad");
    assert!(!base.path().join("MODS").exists());
}

#[test]
fn test_colliding_long_names_on_a_drive() {
    let base = tempfile::tempdir().unwrap();
    populate(base.path(), &[("MYDOCUMENT.TEX", b"tex"), ("My Document.Text", b"text")]);

    let mut drive = LocalDrive::new(base.path(), MediaKind::HardDisk);
    let listed = names(&mut drive, "MYDOCU*.*");
    assert_eq!(listed, vec!["MYDOCU~1.TEX", "MYDOCU~2.TEX"]);
    assert_eq!(drive.read_file("MYDOCU~1.TEX").unwrap(), b"tex");
    assert_eq!(drive.read_file("MYDOCU~2.TEX").unwrap(), b"text");
}

#[test]
fn test_added_entries_resolve_both_ways() {
    let base = tempfile::tempdir().unwrap();
    let names_in = ["longfilename_c.txt", "longfilename_a.txt", "longfilename_b.txt"];

    let mut forward = DirectoryCache::new(base.path());
    forward.list_directory("").unwrap();
    let mut backward = DirectoryCache::new(base.path());
    backward.list_directory("").unwrap();
    for name in names_in {
        fs::write(base.path().join(name), b"x").unwrap();
    }
    for name in names_in {
        forward.add_entry(name, true).unwrap();
    }
    for name in names_in.iter().rev() {
        backward.add_entry(name, true).unwrap();
    }

    let mut rebuilt = DirectoryCache::new(base.path());
    let mut seen = std::collections::HashSet::new();
    for name in names_in {
        let short = rebuilt.get_short_name("", name).unwrap().unwrap();
        assert!(seen.insert(short.clone()), "duplicate short name {}", short);
        for cache in [&mut forward, &mut backward] {
            let alias = cache.get_short_name("", name).unwrap().unwrap();
            assert_eq!(cache.get_long_name("", &alias).unwrap().as_deref(), Some(name));
        }
    }
}

#[test]
fn test_legacy_alias_matches_other_tools() {
    assert_eq!(short_name::legacy_hash(b"a"), 0xF2EE);
    assert_eq!(short_name::legacy_short_name("a"), "A~~~~2XO");

    let base = tempfile::tempdir().unwrap();
    populate(base.path(), &[("Very Long Folder Name/inside.txt", b"in")]);
    let mut drive = LocalDrive::new(base.path(), MediaKind::HardDisk);
    let alias = short_name::legacy_short_name("Very Long Folder Name");
    assert_eq!(drive.read_file(&format!("{}\\INSIDE.TXT", alias)).unwrap(), b"in");
}

#[test]
fn test_search_pool_of_four() {
    let base = tempfile::tempdir().unwrap();
    populate(base.path(), &[("one.txt", b"1"), ("two.txt", b"2")]);

    let mut drive = LocalDrive::new(base.path(), MediaKind::HardDisk).with_session_limit(4);
    let mut handles: Vec<_> = (0..4)
        .map(|_| drive.find_first("*.*", FatAttributes::empty()).unwrap())
        .collect();
    let mut fifth = drive.find_first("*.*", FatAttributes::empty()).unwrap();

    assert!(drive.find_next(&mut handles[0]).is_none());
    assert!(drive.find_next(&mut handles[0]).is_none());
    assert_eq!(drive.find_next(&mut handles[1]).unwrap().name, "ONE.TXT");
    assert_eq!(drive.find_next(&mut fifth).unwrap().name, "ONE.TXT");
    assert_eq!(drive.find_next(&mut fifth).unwrap().name, "TWO.TXT");
    assert!(drive.find_next(&mut fifth).is_none());
}

#[test]
fn test_mount_table_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    populate(root.path(), &[("game/readme.txt", b"read me"), ("cd1/setup.exe", b"MZ1"), ("cd2/setup.exe", b"MZ2")]);
    fs::create_dir(root.path().join("saves")).unwrap();

    let bundle = {
        let mut buf = Cursor::new(Vec::new());
        let mut zip = zip::ZipWriter::new(&mut buf);
        zip.start_file("HELP.TXT", zip::write::SimpleFileOptions::default()).unwrap();
        zip.write_all(b"help").unwrap();
        zip.finish().unwrap();
        buf.into_inner()
    };
    fs::write(root.path().join("tools.zip"), bundle).unwrap();

    let config = root.path().join("mounts.json");
    fs::write(
        &config,
        r#"{ "drives": [
            { "letter": "C", "type": "overlay", "path": "game", "overlay": "saves", "label": "game" },
            { "letter": "D", "type": "cdrom", "paths": ["cd1", "cd2"], "label": "Install Disc" },
            { "letter": "Z", "type": "virtual", "bundle": "tools.zip" }
        ] }"#,
    )
    .unwrap();

    let table = MountTable::load_from_path(&config).unwrap();
    let manager = DriveManager::new();
    manager.apply_mount_table(&table, &VirtualRegistry::new()).unwrap();

    let types: Vec<(char, DriveType)> = manager.list().iter().map(|l| (l.letter, l.drive_type)).collect();
    assert_eq!(
        types,
        vec![('C', DriveType::Overlay), ('D', DriveType::CdRom), ('Z', DriveType::Virtual)]
    );

    manager.write_file('C', "SAVE.DAT", b"progress").unwrap();
    assert!(root.path().join("saves").join("SAVE.DAT").exists());
    assert!(!root.path().join("game").join("SAVE.DAT").exists());
    assert_eq!(manager.read_file('C', "README.TXT").unwrap(), b"read me");

    assert_eq!(manager.read_file('D', "SETUP.EXE").unwrap(), b"MZ1");
    assert!(matches!(manager.write_file('D', "X.TXT", b"x"), Err(DosError::AccessDenied(_))));
    manager.cycle('D').unwrap();
    assert_eq!(manager.read_file('D', "SETUP.EXE").unwrap(), b"MZ2");
    assert_eq!(manager.list()[1].label, "Install .Dis");

    assert_eq!(manager.read_file('Z', "HELP.TXT").unwrap(), b"help");
}

#[test]
fn test_bundle_on_virtual_drive() {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        zip.add_directory("bin/", options).unwrap();
        zip.start_file("bin/Utility Program.com", options).unwrap();
        zip.write_all(b"\xC3").unwrap();
        zip.finish().unwrap();
    }
    let registry = VirtualRegistry::new();
    assert_eq!(load_bundle(Cursor::new(buf.into_inner()), &registry).unwrap(), 1);

    let mut drive = dos_core::VirtualDrive::new(registry);
    assert_eq!(names(&mut drive, "BIN\\*.*"), vec![".", "..", "UTILIT~1.COM"]);
    assert_eq!(drive.read_file("BIN\\UTILIT~1.COM").unwrap(), b"\xC3");
    assert_eq!(drive.read_file("bin\\utility program.com").unwrap(), b"\xC3");
}
