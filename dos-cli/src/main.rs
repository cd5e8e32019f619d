//! DOS drive CLI - Mount drives and run drive commands from the command line.
//!
//! Usage:
//!   dosdrive [--config mounts.json] [--mount L:TYPE:PATH ...] <command>
//!
//! Examples:
//!   dosdrive --mount C:dir:./game list                  # Show the drive table
//!   dosdrive --mount C:dir:./game --mount C:overlay:./saves dir 'C:*.*'
//!   dosdrive --mount C:dir:./game type C:README.TXT     # Print a file
//!   dosdrive --mount A:floppy:./d1;./d2 cycle A         # Swap to the next disk
//!   dosdrive --bundle tools.zip dir 'Z:*.*'             # Browse a resource bundle

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use dos_core::fs::{join_dos, normalize_dos_path, split_drive_path, split_parent};
use dos_core::{
    DosError, DosResult, DriveManager, DriveType, FatAttributes, FindEntry, MountEntry, MountTable, VirtualRegistry,
};

/// DOS drive emulation CLI
#[derive(Parser, Debug)]
#[command(name = "dosdrive")]
#[command(about = "Mount host directories as DOS drives and work with them")]
struct Args {
    /// JSON mount table to apply first
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Extra mount, as LETTER:TYPE[:PATH[;PATH...]] (repeatable)
    #[arg(short, long, value_name = "SPEC")]
    mount: Vec<MountEntry>,

    /// ZIP bundle to serve on Z: as a virtual drive
    #[arg(short, long, value_name = "ZIP")]
    bundle: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List mounted drives
    List {
        /// Print the table as JSON
        #[arg(long)]
        json: bool,
    },
    /// List a directory, e.g. C:\GAMES\*.EXE
    Dir {
        pattern: String,
        /// Include hidden and system entries
        #[arg(short, long)]
        all: bool,
    },
    /// Print a file to stdout
    Type { path: String },
    /// Copy a host file onto a drive
    CopyIn { host: PathBuf, dest: String },
    /// Delete a file
    Del { path: String },
    /// Create a directory
    Md { path: String },
    /// Remove an empty directory
    Rd { path: String },
    /// Rename a file
    Ren { from: String, to: String },
    /// Show or change file attributes
    Attrib {
        path: String,
        /// Set the read-only attribute
        #[arg(long, conflicts_with = "writable")]
        read_only: bool,
        /// Clear the read-only attribute
        #[arg(long)]
        writable: bool,
    },
    /// Show the volume label of a drive
    Label { drive: char },
    /// Swap to the next disk of a drive, or of every floppy and CD-ROM drive
    Cycle { drive: Option<char> },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Mount everything the command line asks for.
fn build_manager(args: &Args) -> DosResult<DriveManager> {
    let manager = DriveManager::new();
    let registry = VirtualRegistry::new();

    if let Some(config) = &args.config {
        let table = MountTable::load_from_path(config)?;
        debug!(drives = table.drives.len(), "loaded mount table");
        manager.apply_mount_table(&table, &registry)?;
    }
    for entry in &args.mount {
        manager.apply_entry(entry, &registry)?;
    }
    if let Some(bundle) = &args.bundle {
        let mut entry = MountEntry::new('Z', DriveType::Virtual);
        entry.bundle = Some(bundle.clone());
        manager.apply_entry(&entry, &registry)?;
    }
    Ok(manager)
}

fn format_date(date: u16, time: u16) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}",
        1980 + (date >> 9),
        (date >> 5) & 0x0f,
        date & 0x1f,
        time >> 11,
        (time >> 5) & 0x3f
    )
}

fn print_entry(entry: &FindEntry) {
    let (stem, ext) = match entry.name.rfind('.') {
        Some(pos) if entry.name != "." && entry.name != ".." => (&entry.name[..pos], &entry.name[pos + 1..]),
        _ => (entry.name.as_str(), ""),
    };
    let size = if entry.attributes.contains(FatAttributes::DIRECTORY) {
        "<DIR>".to_string()
    } else {
        entry.size.to_string()
    };
    println!("{:<8} {:<3} {:>10}  {}", stem, ext, size, format_date(entry.date, entry.time));
}

fn attribute_flags(attributes: FatAttributes) -> String {
    [
        (FatAttributes::ARCHIVE, 'A'),
        (FatAttributes::SYSTEM, 'S'),
        (FatAttributes::HIDDEN, 'H'),
        (FatAttributes::READ_ONLY, 'R'),
        (FatAttributes::DIRECTORY, 'D'),
    ]
    .iter()
    .map(|&(flag, c)| if attributes.contains(flag) { c } else { ' ' })
    .collect()
}

/// Drive-relative target of REN.
///
/// A bare name stays in the source's directory; anything else must be a
/// path on the same drive.
fn rename_target(letter: char, old: &str, to: &str) -> DosResult<String> {
    match split_drive_path(to) {
        Ok((other, _)) if other != letter => Err(DosError::PathNotSupported(to.to_string())),
        Ok((_, new)) => Ok(new.to_string()),
        Err(_) if to.contains(['\\', '/']) => Ok(to.to_string()),
        Err(_) => {
            let old = normalize_dos_path(old)?;
            Ok(join_dos(split_parent(&old).0, to))
        }
    }
}

fn run(manager: &DriveManager, command: Command) -> DosResult<()> {
    match command {
        Command::List { json } => {
            let drives = manager.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&drives)?);
                return Ok(());
            }
            for drive in drives {
                println!(
                    "{}: {:<8} {:<12} [{}/{}] {}",
                    drive.letter,
                    drive.drive_type.as_str(),
                    drive.label,
                    drive.disk_position,
                    drive.disk_count,
                    drive.backing
                );
            }
        }
        Command::Dir { pattern, all } => {
            let (letter, rest) = split_drive_path(&pattern)?;
            let mut attributes = FatAttributes::DIRECTORY;
            if all {
                attributes |= FatAttributes::HIDDEN | FatAttributes::SYSTEM;
            }
            let (label, entries, free) = manager.with_drive(letter, |drive| {
                let entries = drive.list(rest, attributes)?;
                Ok((drive.label(), entries, drive.allocation_info().free_bytes()))
            })?;
            if label.is_empty() {
                println!(" Volume in drive {} has no label", letter);
            } else {
                println!(" Volume in drive {} is {}", letter, label);
            }
            for entry in &entries {
                print_entry(entry);
            }
            println!("{:>9} file(s) {:>14} bytes free", entries.len(), free);
        }
        Command::Type { path } => {
            let (letter, rest) = split_drive_path(&path)?;
            let data = manager.read_file(letter, rest)?;
            std::io::stdout().write_all(&data)?;
        }
        Command::CopyIn { host, dest } => {
            let (letter, rest) = split_drive_path(&dest)?;
            let data = std::fs::read(&host)?;
            manager.write_file(letter, rest, &data)?;
            println!("        1 file(s) copied");
        }
        Command::Del { path } => {
            let (letter, rest) = split_drive_path(&path)?;
            manager.with_drive(letter, |drive| drive.unlink(rest))?;
        }
        Command::Md { path } => {
            let (letter, rest) = split_drive_path(&path)?;
            manager.with_drive(letter, |drive| drive.make_directory(rest))?;
        }
        Command::Rd { path } => {
            let (letter, rest) = split_drive_path(&path)?;
            manager.with_drive(letter, |drive| drive.remove_directory(rest))?;
        }
        Command::Ren { from, to } => {
            let (letter, old) = split_drive_path(&from)?;
            let new = rename_target(letter, old, &to)?;
            manager.with_drive(letter, |drive| drive.rename(old, &new))?;
        }
        Command::Attrib {
            path,
            read_only,
            writable,
        } => {
            let (letter, rest) = split_drive_path(&path)?;
            let attributes = manager.with_drive(letter, |drive| {
                let mut attributes = drive.get_attributes(rest)?;
                if read_only || writable {
                    attributes.set(FatAttributes::READ_ONLY, read_only);
                    drive.set_attributes(rest, attributes)?;
                }
                Ok(attributes)
            })?;
            println!("{}  {}:{}", attribute_flags(attributes), letter, rest);
        }
        Command::Label { drive } => {
            let letter = drive.to_ascii_uppercase();
            let label = manager.with_drive(letter, |drive| Ok(drive.label()))?;
            println!("{}", label);
        }
        Command::Cycle { drive } => match drive {
            Some(drive) => {
                let position = manager.cycle(drive)?;
                println!("Drive {}: disk {}", drive.to_ascii_uppercase(), position);
            }
            None => {
                manager.cycle_all_disks()?;
                manager.cycle_all_cds()?;
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    // Drive operations block on host I/O
    let result = tokio::task::spawn_blocking(move || {
        let manager = build_manager(&args)?;
        run(&manager, args.command)
    })
    .await?;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_target_keeps_directory() {
        assert_eq!(rename_target('C', "\\GAMES\\A.TXT", "B.TXT").unwrap(), "GAMES\\B.TXT");
        assert_eq!(rename_target('C', "A.TXT", "B.TXT").unwrap(), "B.TXT");
        assert_eq!(rename_target('C', "GAMES\\A.TXT", "C:\\SAVES\\B.TXT").unwrap(), "\\SAVES\\B.TXT");
        assert_eq!(rename_target('C', "GAMES\\A.TXT", "SAVES\\B.TXT").unwrap(), "SAVES\\B.TXT");
        assert!(matches!(
            rename_target('C', "A.TXT", "D:B.TXT"),
            Err(DosError::PathNotSupported(_))
        ));
    }
}
